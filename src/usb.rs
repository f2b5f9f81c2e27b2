//! Bulk transport over a rusb device handle
//!
//! rusb transfers are synchronous, so transmit "completion" is known as soon
//! as `write_bulk` returns. Completions are queued and handed to the channel
//! by [`RusbTransport::pump`], which also performs the bulk IN read of the
//! channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use rusb::{DeviceHandle, GlobalContext};

use crate::channel::Channel;
use crate::error::{IxxatError, Result};
use crate::transport::{BulkTransport, TransferStatus};
use crate::tx_pool::TxToken;

const BULK_OUT_TIMEOUT: Duration = Duration::from_millis(1000);

/// [`BulkTransport`] on top of a shared rusb handle
pub struct RusbTransport {
    handle: Arc<DeviceHandle<GlobalContext>>,
    completions: Mutex<VecDeque<(u8, TxToken, TransferStatus)>>,
    /// Posted IN endpoints and their buffer size
    rx: Mutex<HashMap<u8, usize>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RusbTransport {
    /// Wrap a handle whose interface is already claimed
    pub fn new(handle: Arc<DeviceHandle<GlobalContext>>) -> Self {
        Self {
            handle,
            completions: Mutex::new(VecDeque::new()),
            rx: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver pending transmit completions and read one bulk IN buffer
    ///
    /// Returns the number of records handled. A read timeout is not an
    /// error; a framing error is logged by the channel, the rest of the
    /// buffer dropped, and the records before it still counted.
    pub fn pump(&self, channel: &Channel, timeout: Duration) -> Result<usize> {
        let eps = channel.endpoints();

        let done: Vec<_> = {
            let mut completions = lock(&self.completions);
            let (mine, others): (Vec<_>, Vec<_>) =
                completions.drain(..).partition(|(ep, _, _)| *ep == eps.msg_out);
            completions.extend(others);
            mine
        };
        for (_, token, status) in done {
            channel.complete_tx(token, status);
        }

        let Some(size) = lock(&self.rx).get(&eps.msg_in).copied() else {
            return Ok(0);
        };

        let mut buf = vec![0u8; size];
        match self.handle.read_bulk(eps.msg_in, &mut buf, timeout) {
            Ok(len) => records_handled(channel.handle_rx(&buf[..len])),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(rusb::Error::NoDevice) => {
                channel.detach();
                Err(IxxatError::NoDevice)
            }
            Err(e) => Err(IxxatError::Usb(e)),
        }
    }
}

fn records_handled(rx: Result<usize>) -> Result<usize> {
    match rx {
        Err(IxxatError::Framing { decoded, .. }) => Ok(decoded),
        other => other,
    }
}

impl BulkTransport for RusbTransport {
    fn submit(&self, endpoint: u8, buffer: Vec<u8>, token: TxToken) -> rusb::Result<()> {
        let status = match self.handle.write_bulk(endpoint, &buffer, BULK_OUT_TIMEOUT) {
            Ok(n) if n == buffer.len() => TransferStatus::Completed,
            Ok(n) => {
                warn!("Short bulk write on 0x{:02x}: {} of {}", endpoint, n, buffer.len());
                TransferStatus::Failed(rusb::Error::Io)
            }
            Err(e) => return Err(e),
        };
        lock(&self.completions).push_back((endpoint, token, status));
        Ok(())
    }

    fn start_rx(&self, endpoint: u8, buffer_size: usize) -> rusb::Result<()> {
        debug!("Receiving on 0x{:02x}, {} byte buffers", endpoint, buffer_size);
        lock(&self.rx).insert(endpoint, buffer_size);
        Ok(())
    }

    fn cancel_all(&self, msg_in: u8, msg_out: u8) {
        lock(&self.rx).remove(&msg_in);
        lock(&self.completions).retain(|(ep, _, _)| *ep != msg_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_counts_earlier_records() {
        let truncated = IxxatError::Framing {
            offset: 30,
            remaining: 7,
            decoded: 2,
        };
        assert_eq!(records_handled(Err(truncated)).unwrap(), 2);
        assert_eq!(records_handled(Ok(5)).unwrap(), 5);
        assert!(matches!(
            records_handled(Err(IxxatError::NoDevice)),
            Err(IxxatError::NoDevice)
        ));
    }
}
