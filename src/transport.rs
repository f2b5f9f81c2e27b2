//! Command transport
//!
//! Commands travel over the default control pipe as vendor requests. The
//! request (envelope plus payload) is written with bounded retries; the
//! response is then read back, possibly in several chunks, until the number
//! of bytes received matches the size the device declared.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use rusb::{DeviceHandle, UsbContext};

use crate::constants::*;
use crate::error::{IxxatError, Result};
use crate::structures::{DeviceCaps, DeviceInfo, Envelope, ResponseHeader};
use crate::timing::InitCommand;
use crate::tx_pool::TxToken;

/// Control pipe of a USB device
///
/// Signatures follow `rusb::DeviceHandle`, which implements this trait.
pub trait ControlPipe: Send {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

impl<T: UsbContext> ControlPipe for DeviceHandle<T> {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
    }
}

impl<P: ControlPipe + Sync + ?Sized> ControlPipe for std::sync::Arc<P> {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        (**self).write_control(request_type, request, value, index, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        (**self).read_control(request_type, request, value, index, buf, timeout)
    }
}

/// Outcome of a bulk OUT transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// All bytes were sent
    Completed,
    /// Transfer was cancelled
    Cancelled,
    /// Transfer failed
    Failed(rusb::Error),
}

/// Bulk transfer provider
///
/// `submit` queues a bulk OUT transfer; the provider reports its completion
/// through [`crate::channel::Channel::complete_tx`] with the same token.
/// Inbound buffers are handed to [`crate::channel::Channel::handle_rx`].
pub trait BulkTransport: Send + Sync {
    /// Queue `buffer` on bulk OUT `endpoint`
    fn submit(&self, endpoint: u8, buffer: Vec<u8>, token: TxToken) -> rusb::Result<()>;

    /// Post receive transfers of `buffer_size` bytes on bulk IN `endpoint`
    fn start_rx(&self, endpoint: u8, buffer_size: usize) -> rusb::Result<()>;

    /// Cancel every outstanding transfer on both endpoints
    fn cancel_all(&self, msg_in: u8, msg_out: u8);
}

/// Command transport timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Attempts per send and per receive
    pub retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Per-attempt transfer timeout
    pub timeout: Duration,
    /// Delay after the power wake-up command
    pub wakeup_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retries: IXXAT_USB_MAX_COM_REQ,
            retry_delay: IXXAT_USB_MSG_CYCLE,
            timeout: IXXAT_USB_MSG_TIMEOUT,
            wakeup_delay: IXXAT_USB_POWER_WAKEUP_TIME,
        }
    }
}

/// Synchronous command channel to the board
///
/// Only one command is in flight at a time; concurrent callers wait on the
/// pipe lock.
pub struct CommandTransport {
    pipe: Mutex<Box<dyn ControlPipe>>,
    config: TransportConfig,
}

impl CommandTransport {
    /// Create a transport with the default timing
    pub fn new(pipe: Box<dyn ControlPipe>) -> Self {
        Self::with_config(pipe, TransportConfig::default())
    }

    /// Create a transport with explicit timing
    pub fn with_config(pipe: Box<dyn ControlPipe>, config: TransportConfig) -> Self {
        Self {
            pipe: Mutex::new(pipe),
            config,
        }
    }

    /// Transport timing
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn ControlPipe>> {
        self.pipe.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a packed command on `port`
    pub fn send_command(&self, port: u16, data: &[u8]) -> Result<()> {
        let pipe = self.lock();
        self.send_locked(pipe.as_ref(), port, data)
    }

    /// Read a response of `expected_size` bytes from `port`
    pub fn receive_response(&self, port: u16, expected_size: usize) -> Result<Vec<u8>> {
        let pipe = self.lock();
        self.receive_locked(pipe.as_ref(), port, expected_size)
    }

    fn send_locked(&self, pipe: &dyn ControlPipe, port: u16, data: &[u8]) -> Result<()> {
        let mut last = rusb::Error::Timeout;
        for attempt in 1..=self.config.retries {
            match pipe.write_control(
                IXXAT_USB_REQUEST_TYPE_OUT,
                IXXAT_USB_VENDOR_REQUEST,
                port,
                0,
                data,
                self.config.timeout,
            ) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    warn!("Short command write on port {}: {} of {} bytes", port, n, data.len());
                    last = rusb::Error::Io;
                }
                Err(rusb::Error::NoDevice) => return Err(IxxatError::NoDevice),
                Err(e) => {
                    warn!("Command write on port {} failed (attempt {}): {}", port, attempt, e);
                    last = e;
                }
            }
            if attempt < self.config.retries {
                thread::sleep(self.config.retry_delay);
            }
        }
        Err(IxxatError::ControlTransfer {
            attempts: self.config.retries,
            source: last,
        })
    }

    fn receive_locked(
        &self,
        pipe: &dyn ControlPipe,
        port: u16,
        expected_size: usize,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; expected_size];
        let mut pos = 0;
        let mut declared = None;
        let mut last = None;

        for attempt in 1..=self.config.retries {
            match pipe.read_control(
                IXXAT_USB_REQUEST_TYPE_IN,
                IXXAT_USB_VENDOR_REQUEST,
                port,
                0,
                &mut buf[pos..],
                self.config.timeout,
            ) {
                Ok(n) => pos += n,
                Err(rusb::Error::NoDevice) => return Err(IxxatError::NoDevice),
                Err(e) => {
                    warn!("Response read on port {} failed (attempt {}): {}", port, attempt, e);
                    last = Some(e);
                }
            }

            if declared.is_none() && pos >= IXXAT_USB_RES_HEADER_SIZE {
                declared = Some(ResponseHeader::unpack(&buf).size as usize);
            }
            let done = match declared {
                Some(size) => pos >= size || pos == expected_size,
                None => pos == expected_size,
            };
            if done {
                let declared = declared.unwrap_or(0);
                if pos != declared || pos != expected_size {
                    return Err(IxxatError::MalformedResponse {
                        expected: declared.max(expected_size),
                        actual: pos,
                    });
                }
                return Ok(buf);
            }

            if attempt < self.config.retries {
                thread::sleep(self.config.retry_delay);
            }
        }

        if pos == 0 {
            return Err(IxxatError::ControlTransfer {
                attempts: self.config.retries,
                source: last.unwrap_or(rusb::Error::Timeout),
            });
        }
        Err(IxxatError::MalformedResponse {
            expected: declared.unwrap_or(expected_size),
            actual: pos,
        })
    }

    /// Run one command and return the response payload
    pub fn execute(
        &self,
        code: u32,
        port: u16,
        payload: &[u8],
        response_payload: usize,
    ) -> Result<Vec<u8>> {
        let env = Envelope::new(code, port, payload.len(), response_payload);
        let data = env.pack(payload);

        debug!("Command 0x{:03x} on port 0x{:04x}", code, port);
        let pipe = self.lock();
        self.send_locked(pipe.as_ref(), port, &data)?;
        let response = self.receive_locked(pipe.as_ref(), port, env.response_size())?;
        drop(pipe);

        let header = ResponseHeader::unpack(&response);
        if header.code != 0 {
            return Err(IxxatError::CommandFailed {
                code,
                result: header.code,
            });
        }
        Ok(response[IXXAT_USB_RES_HEADER_SIZE..].to_vec())
    }

    /// Reset a controller
    pub fn reset(&self, port: u16) -> Result<()> {
        self.execute(IXXAT_USB_CAN_CMD_RESET, port, &[], 0)?;
        Ok(())
    }

    /// Initialize a controller
    pub fn init(&self, port: u16, init: &InitCommand) -> Result<()> {
        self.execute(init.code(), port, &init.pack(), 0)?;
        Ok(())
    }

    /// Start a controller, returns the device start timestamp
    pub fn start(&self, port: u16) -> Result<u32> {
        let payload = self.execute(IXXAT_USB_CAN_CMD_START, port, &[], 4)?;
        Ok(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Stop a controller
    pub fn stop(&self, port: u16, action: u32) -> Result<()> {
        self.execute(IXXAT_USB_CAN_CMD_STOP, port, &action.to_le_bytes(), 0)?;
        Ok(())
    }

    /// Board power management
    pub fn power(&self, mode: u8) -> Result<()> {
        self.execute(
            IXXAT_USB_BRD_CMD_POWER,
            IXXAT_USB_BOARD_PORT,
            &[mode, 0, 0, 0],
            0,
        )?;
        Ok(())
    }

    /// Query board capabilities
    pub fn device_caps(&self) -> Result<DeviceCaps> {
        let payload = self.execute(
            IXXAT_USB_BRD_CMD_GET_DEVCAPS,
            IXXAT_USB_BOARD_PORT,
            &[],
            DeviceCaps::SIZE,
        )?;
        DeviceCaps::unpack(&payload)
    }

    /// Query board identification
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let payload = self.execute(
            IXXAT_USB_BRD_CMD_GET_DEVINFO,
            IXXAT_USB_BOARD_PORT,
            &[],
            DeviceInfo::SIZE,
        )?;
        DeviceInfo::unpack(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct Script {
        writes: Vec<(u16, Vec<u8>)>,
        write_results: VecDeque<rusb::Result<()>>,
        reads: VecDeque<rusb::Result<Vec<u8>>>,
        read_calls: u32,
    }

    /// Control pipe replaying scripted results; unscripted calls time out
    #[derive(Clone, Default)]
    struct ScriptedPipe(Arc<Mutex<Script>>);

    impl ControlPipe for ScriptedPipe {
        fn write_control(
            &self,
            _request_type: u8,
            _request: u8,
            value: u16,
            _index: u16,
            buf: &[u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            let mut s = self.0.lock().unwrap();
            s.writes.push((value, buf.to_vec()));
            match s.write_results.pop_front() {
                Some(Ok(())) => Ok(buf.len()),
                Some(Err(e)) => Err(e),
                None => Err(rusb::Error::Timeout),
            }
        }

        fn read_control(
            &self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            let mut s = self.0.lock().unwrap();
            s.read_calls += 1;
            match s.reads.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(rusb::Error::Timeout),
            }
        }
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            retry_delay: Duration::ZERO,
            timeout: Duration::from_millis(1),
            wakeup_delay: Duration::ZERO,
            ..TransportConfig::default()
        }
    }

    fn transport(pipe: &ScriptedPipe) -> CommandTransport {
        CommandTransport::with_config(Box::new(pipe.clone()), fast_config())
    }

    fn response(payload: &[u8]) -> Vec<u8> {
        let header = ResponseHeader {
            size: (IXXAT_USB_RES_HEADER_SIZE + payload.len()) as u32,
            returned_size: payload.len() as u32,
            code: 0,
        };
        let mut buf = header.pack().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_send_gives_up_after_bound() {
        let pipe = ScriptedPipe::default();
        let err = transport(&pipe).send_command(0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            IxxatError::ControlTransfer {
                attempts: 10,
                source: rusb::Error::Timeout
            }
        ));
        assert_eq!(pipe.0.lock().unwrap().writes.len(), 10);
    }

    #[test]
    fn test_receive_gives_up_after_bound() {
        let pipe = ScriptedPipe::default();
        let err = transport(&pipe).receive_response(0, 12).unwrap_err();
        assert!(matches!(err, IxxatError::ControlTransfer { attempts: 10, .. }));
        assert_eq!(pipe.0.lock().unwrap().read_calls, 10);
    }

    #[test]
    fn test_send_retries_then_succeeds() {
        let pipe = ScriptedPipe::default();
        {
            let mut s = pipe.0.lock().unwrap();
            s.write_results.push_back(Err(rusb::Error::Pipe));
            s.write_results.push_back(Err(rusb::Error::Timeout));
            s.write_results.push_back(Ok(()));
        }
        transport(&pipe).send_command(2, &[0; 24]).unwrap();
        let s = pipe.0.lock().unwrap();
        assert_eq!(s.writes.len(), 3);
        assert_eq!(s.writes[2].0, 2);
    }

    #[test]
    fn test_chunked_response() {
        let pipe = ScriptedPipe::default();
        let full = response(&[0x78, 0x56, 0x34, 0x12]);
        {
            let mut s = pipe.0.lock().unwrap();
            s.write_results.push_back(Ok(()));
            s.reads.push_back(Ok(full[..5].to_vec()));
            s.reads.push_back(Err(rusb::Error::Timeout));
            s.reads.push_back(Ok(full[5..13].to_vec()));
            s.reads.push_back(Ok(full[13..].to_vec()));
        }
        let t = transport(&pipe);
        assert_eq!(t.start(0).unwrap(), 0x1234_5678);

        let s = pipe.0.lock().unwrap();
        let sent = &s.writes[0].1;
        assert_eq!(sent.len(), 24);
        assert_eq!(sent[8..12], IXXAT_USB_CAN_CMD_START.to_le_bytes());
        // response header template follows the request
        assert_eq!(sent[12..16], 16u32.to_le_bytes());
        assert_eq!(sent[20..24], IXXAT_USB_UNSET_RESULT.to_le_bytes());
    }

    #[test]
    fn test_declared_size_shorter_than_expected() {
        let pipe = ScriptedPipe::default();
        pipe.0
            .lock()
            .unwrap()
            .reads
            .push_back(Ok(response(&[])));
        let err = transport(&pipe).receive_response(0, 16).unwrap_err();
        assert!(matches!(
            err,
            IxxatError::MalformedResponse {
                expected: 16,
                actual: 12
            }
        ));
    }

    #[test]
    fn test_declared_size_longer_than_delivered() {
        let pipe = ScriptedPipe::default();
        let mut bytes = response(&[0; 4]);
        bytes[0..4].copy_from_slice(&24u32.to_le_bytes());
        pipe.0.lock().unwrap().reads.push_back(Ok(bytes));
        let err = transport(&pipe).receive_response(0, 16).unwrap_err();
        assert!(matches!(
            err,
            IxxatError::MalformedResponse {
                expected: 24,
                actual: 16
            }
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_partial_response_then_silence() {
        let pipe = ScriptedPipe::default();
        pipe.0
            .lock()
            .unwrap()
            .reads
            .push_back(Ok(response(&[1, 2, 3, 4])[..8].to_vec()));
        let err = transport(&pipe).receive_response(0, 16).unwrap_err();
        assert!(matches!(err, IxxatError::MalformedResponse { actual: 8, .. }));
    }

    #[test]
    fn test_no_device_aborts_retries() {
        let pipe = ScriptedPipe::default();
        pipe.0
            .lock()
            .unwrap()
            .write_results
            .push_back(Err(rusb::Error::NoDevice));
        let err = transport(&pipe).reset(0).unwrap_err();
        assert!(err.is_no_device());
        assert_eq!(pipe.0.lock().unwrap().writes.len(), 1);
    }

    #[test]
    fn test_command_failed() {
        let pipe = ScriptedPipe::default();
        let mut bytes = response(&[]);
        bytes[8..12].copy_from_slice(&5u32.to_le_bytes());
        {
            let mut s = pipe.0.lock().unwrap();
            s.write_results.push_back(Ok(()));
            s.reads.push_back(Ok(bytes));
        }
        let err = transport(&pipe).stop(1, IXXAT_USB_STOP_ACTION_CLEARALL).unwrap_err();
        assert!(matches!(
            err,
            IxxatError::CommandFailed {
                code: IXXAT_USB_CAN_CMD_STOP,
                result: 5
            }
        ));
    }
}
