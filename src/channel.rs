//! CAN channel lifecycle and data path
//!
//! A [`Channel`] is one CAN controller on the board. Opening it provisions
//! the bulk transfers and starts the controller; several users may hold it
//! open at once and only the last close stops it. Receive buffers and
//! transmit completions are fed in by the bulk transport and reported to
//! the channel's [`NetSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};

use crate::adapter::{Adapter, Endpoints};
use crate::constants::*;
use crate::error::{IxxatError, Result};
use crate::frame::{encode_record, CanFrame};
use crate::message::{decode_records, Record};
use crate::sink::NetSink;
use crate::state::{BusMonitor, CanState, ChannelStats, ErrorCounters};
use crate::timestamp::{host_time_us, TimeReference};
use crate::timing::{encode_init, BitTiming, CtrlMode};
use crate::transport::{BulkTransport, CommandTransport, TransferStatus};
use crate::tx_pool::{TxContextPool, TxToken};

/// Default nominal sample point in percent
pub const DEFAULT_SAMPLE_POINT: f32 = 87.5;

/// Default data phase sample point in percent
pub const DEFAULT_DATA_SAMPLE_POINT: f32 = 75.0;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of handing a frame to [`Channel::transmit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Frame is on its way to the device
    Queued,
    /// No transmit slot free; the queue has been stopped, retry after a wake
    Busy,
}

#[derive(Debug, Default)]
struct Control {
    lifecycle: Lifecycle,
    open_count: u32,
    bittiming: Option<BitTiming>,
    data_bittiming: Option<BitTiming>,
    ctrlmode: CtrlMode,
}

#[derive(Debug, Default)]
struct RxState {
    monitor: BusMonitor,
    time_ref: TimeReference,
}

/// One CAN controller of an attached board
pub struct Channel {
    adapter: &'static Adapter,
    index: u8,
    endpoints: Endpoints,
    commands: Arc<CommandTransport>,
    bulk: Arc<dyn BulkTransport>,
    sink: Arc<dyn NetSink>,
    /// Held across lifecycle commands
    control: Mutex<Control>,
    /// Held only briefly, from the receive and completion paths
    rx: Mutex<RxState>,
    tx: TxContextPool,
    running: AtomicBool,
    queue_stopped: AtomicBool,
    gone: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Channel {
    /// Create a stopped channel
    pub fn new(
        adapter: &'static Adapter,
        index: u8,
        endpoints: Endpoints,
        commands: Arc<CommandTransport>,
        bulk: Arc<dyn BulkTransport>,
        sink: Arc<dyn NetSink>,
    ) -> Self {
        Self {
            adapter,
            index,
            endpoints,
            commands,
            bulk,
            sink,
            control: Mutex::new(Control::default()),
            rx: Mutex::new(RxState::default()),
            tx: TxContextPool::new(IXXAT_USB_MAX_TX_URBS),
            running: AtomicBool::new(false),
            queue_stopped: AtomicBool::new(false),
            gone: AtomicBool::new(false),
        }
    }

    /// Controller index on the board, also the command port
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Adapter descriptor
    pub fn adapter(&self) -> &'static Adapter {
        self.adapter
    }

    /// Bulk endpoints of this channel
    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    fn port(&self) -> u16 {
        u16::from(self.index)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn configurable(&self) -> Result<MutexGuard<'_, Control>> {
        let control = lock(&self.control);
        if control.open_count > 0 {
            return Err(IxxatError::Busy);
        }
        Ok(control)
    }

    /// Set the nominal bit timing
    pub fn set_bittiming(&self, bt: BitTiming) -> Result<()> {
        self.adapter.bittiming_const.validate(&bt)?;
        self.configurable()?.bittiming = Some(bt);
        Ok(())
    }

    /// Set the data phase bit timing
    pub fn set_data_bittiming(&self, bt: BitTiming) -> Result<()> {
        let limits = self
            .adapter
            .data_bittiming_const
            .as_ref()
            .ok_or(IxxatError::FdNotSupported)?;
        limits.validate(&bt)?;
        self.configurable()?.data_bittiming = Some(bt);
        Ok(())
    }

    /// Set the nominal bitrate with an 87.5% sample point
    pub fn set_bitrate(&self, bitrate: u32) -> Result<()> {
        self.set_bitrate_with_sample_point(bitrate, DEFAULT_SAMPLE_POINT)
    }

    /// Set the nominal bitrate with a specific sample point
    pub fn set_bitrate_with_sample_point(&self, bitrate: u32, sample_point: f32) -> Result<()> {
        let bt = self
            .adapter
            .bittiming_const
            .calc(self.adapter.clock_hz, bitrate, sample_point)?;
        debug!(
            "Channel {}: {} bit/s -> brp {} tseg1 {} tseg2 {} ({:.1}%)",
            self.index,
            bitrate,
            bt.brp,
            bt.tseg1(),
            bt.phase_seg2,
            bt.sample_point()
        );
        self.set_bittiming(bt)
    }

    /// Set the data phase bitrate with a 75% sample point
    pub fn set_data_bitrate(&self, bitrate: u32) -> Result<()> {
        self.set_data_bitrate_with_sample_point(bitrate, DEFAULT_DATA_SAMPLE_POINT)
    }

    /// Set the data phase bitrate with a specific sample point
    pub fn set_data_bitrate_with_sample_point(&self, bitrate: u32, sample_point: f32) -> Result<()> {
        let limits = self
            .adapter
            .data_bittiming_const
            .as_ref()
            .ok_or(IxxatError::FdNotSupported)?;
        let bt = limits.calc(self.adapter.clock_hz, bitrate, sample_point)?;
        self.set_data_bittiming(bt)
    }

    /// Set the controller mode
    pub fn set_ctrlmode(&self, mode: CtrlMode) -> Result<()> {
        let unsupported = mode.difference(self.adapter.ctrlmode_supported);
        if !unsupported.is_empty() {
            if unsupported.contains(CtrlMode::FD) {
                return Err(IxxatError::FdNotSupported);
            }
            return Err(IxxatError::UnsupportedMode(unsupported.bits()));
        }
        self.configurable()?.ctrlmode = mode;
        Ok(())
    }

    /// Configured nominal bit timing
    pub fn bittiming(&self) -> Option<BitTiming> {
        lock(&self.control).bittiming
    }

    /// Configured data phase bit timing
    pub fn data_bittiming(&self) -> Option<BitTiming> {
        lock(&self.control).data_bittiming
    }

    /// Configured controller mode
    pub fn ctrlmode(&self) -> CtrlMode {
        lock(&self.control).ctrlmode
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the channel
    ///
    /// The first open provisions the bulk transfers, initializes and starts
    /// the controller. Later opens re-initialize it and bump the open count.
    pub fn open(&self) -> Result<()> {
        if self.is_gone() {
            return Err(IxxatError::NoDevice);
        }

        let mut control = lock(&self.control);
        let first = control.open_count == 0;
        if first {
            control.lifecycle = Lifecycle::Starting;
        }

        match self.start_controller(&control, first) {
            Ok(()) => {
                control.open_count += 1;
                if first {
                    control.lifecycle = Lifecycle::Running;
                    self.running.store(true, Ordering::Release);
                    info!("{} channel {} started", self.adapter.name, self.index);
                }
                Ok(())
            }
            Err(e) => {
                error!("Channel {}: open failed: {}", self.index, e);
                if first {
                    self.release_transfers();
                    control.lifecycle = Lifecycle::Stopped;
                }
                if e.is_no_device() {
                    self.mark_gone();
                }
                Err(e)
            }
        }
    }

    fn start_controller(&self, control: &Control, first: bool) -> Result<()> {
        let nominal = control.bittiming.ok_or(IxxatError::BitTimingNotSet)?;
        let data = if control.ctrlmode.contains(CtrlMode::FD) {
            Some(control.data_bittiming.ok_or(IxxatError::BitTimingNotSet)?)
        } else {
            None
        };

        if first {
            self.bulk
                .start_rx(self.endpoints.msg_in, self.adapter.rx_buffer_size)
                .map_err(usb_error)?;
        }

        if let Err(e) = self.commands.reset(self.port()) {
            warn!("Channel {}: reset failed, continuing: {}", self.index, e);
        }

        let init = encode_init(self.adapter, &nominal, data.as_ref(), control.ctrlmode);
        self.commands.init(self.port(), &init)?;

        if first {
            let time = self.commands.start(self.port())?;
            let mut rx = lock(&self.rx);
            rx.time_ref.seed(time, host_time_us());
            rx.monitor.set_state(CanState::ErrorActive);
        }
        Ok(())
    }

    /// Close the channel
    ///
    /// Only the close that drops the open count to zero stops the controller.
    /// If that stop fails for any reason other than a vanished device the
    /// channel stays open and running.
    pub fn close(&self) -> Result<()> {
        let mut control = lock(&self.control);
        if control.open_count == 0 {
            return Err(IxxatError::NotOpen);
        }
        control.open_count -= 1;
        if control.open_count > 0 {
            return Ok(());
        }

        control.lifecycle = Lifecycle::Stopping;
        self.running.store(false, Ordering::Release);

        match self
            .commands
            .stop(self.port(), IXXAT_USB_STOP_ACTION_CLEARALL)
        {
            Ok(()) => {
                self.release_transfers();
                self.set_stopped(&mut control);
                info!("{} channel {} stopped", self.adapter.name, self.index);
                Ok(())
            }
            Err(e) if e.is_no_device() => {
                self.mark_gone();
                self.release_transfers();
                self.set_stopped(&mut control);
                Err(e)
            }
            Err(e) => {
                error!("Channel {}: stop failed: {}", self.index, e);
                control.open_count = 1;
                control.lifecycle = Lifecycle::Running;
                self.running.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Restart a running controller, e.g. to recover from bus-off
    pub fn restart(&self) -> Result<()> {
        let control = lock(&self.control);
        if control.lifecycle != Lifecycle::Running {
            return Err(IxxatError::NotOpen);
        }

        let result = self
            .commands
            .stop(self.port(), IXXAT_USB_STOP_ACTION_CLEARALL)
            .and_then(|()| self.commands.start(self.port()));
        let time = match result {
            Ok(time) => time,
            Err(e) => {
                if e.is_no_device() {
                    self.mark_gone();
                }
                return Err(e);
            }
        };

        {
            let mut rx = lock(&self.rx);
            rx.time_ref.seed(time, host_time_us());
            rx.monitor.on_status(IXXAT_USB_CAN_STATUS_OK);
        }
        info!("Channel {} restarted", self.index);
        if !self.tx.is_full() {
            self.wake_queue();
        }
        Ok(())
    }

    /// Tear the channel down after the device went away
    ///
    /// No command is sent. Outstanding transfers are cancelled and the
    /// channel refuses further use.
    pub fn detach(&self) {
        self.mark_gone();
        self.running.store(false, Ordering::Release);
        self.release_transfers();
        let mut control = lock(&self.control);
        control.open_count = 0;
        self.set_stopped(&mut control);
    }

    fn set_stopped(&self, control: &mut Control) {
        control.lifecycle = Lifecycle::Stopped;
        lock(&self.rx).monitor.set_state(CanState::Stopped);
    }

    fn release_transfers(&self) {
        self.bulk
            .cancel_all(self.endpoints.msg_in, self.endpoints.msg_out);
        self.tx.reset();
        self.queue_stopped.store(false, Ordering::Release);
    }

    fn mark_gone(&self) {
        if !self.gone.swap(true, Ordering::AcqRel) {
            warn!("Channel {}: device gone", self.index);
        }
    }

    /// Check if the device was lost
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Lifecycle phase
    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.control).lifecycle
    }

    /// Number of current users
    pub fn open_count(&self) -> u32 {
        lock(&self.control).open_count
    }

    /// Controller state as last reported by the device
    pub fn state(&self) -> CanState {
        lock(&self.rx).monitor.state()
    }

    /// Last reported error counters
    pub fn error_counters(&self) -> ErrorCounters {
        lock(&self.rx).monitor.counters()
    }

    /// Traffic and error statistics
    pub fn stats(&self) -> ChannelStats {
        *lock(&self.rx).monitor.stats()
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Queue one frame for transmission
    pub fn transmit(&self, frame: &CanFrame) -> Result<TxStatus> {
        if self.is_gone() {
            return Err(IxxatError::NoDevice);
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(IxxatError::NotOpen);
        }

        let record = encode_record(frame, self.adapter.family)?;
        if record.len() > self.adapter.tx_buffer_size {
            return Err(IxxatError::FrameTooLarge {
                size: record.len(),
                max: self.adapter.tx_buffer_size,
            });
        }

        let token = match self.tx.acquire(frame.data().len(), 1) {
            Some(token) => token,
            None => {
                self.stop_queue();
                return Ok(TxStatus::Busy);
            }
        };

        if let Err(e) = self.bulk.submit(self.endpoints.msg_out, record, token) {
            self.tx.release(token);
            lock(&self.rx).monitor.stats_mut().tx_dropped += 1;
            if e == rusb::Error::NoDevice {
                self.mark_gone();
                return Err(IxxatError::NoDevice);
            }
            warn!("Channel {}: transmit submit failed: {}", self.index, e);
            return Err(IxxatError::Usb(e));
        }

        if self.tx.is_full() {
            self.stop_queue();
        }
        Ok(TxStatus::Queued)
    }

    /// Report the completion of a bulk OUT transfer
    pub fn complete_tx(&self, token: TxToken, status: TransferStatus) {
        let Some(released) = self.tx.release(token) else {
            debug!("Channel {}: completion for idle slot {}", self.index, token.0);
            return;
        };

        match status {
            TransferStatus::Completed => {
                let mut rx = lock(&self.rx);
                let stats = rx.monitor.stats_mut();
                stats.tx_packets += u64::from(released.count);
                stats.tx_bytes += released.len as u64;
            }
            TransferStatus::Cancelled => {}
            TransferStatus::Failed(rusb::Error::NoDevice) => {
                self.mark_gone();
                return;
            }
            TransferStatus::Failed(e) => {
                warn!("Channel {}: transmit failed: {}", self.index, e);
                lock(&self.rx).monitor.stats_mut().tx_errors += 1;
            }
        }

        if !self.is_gone() {
            self.wake_queue();
        }
    }

    /// Number of transmit transfers in flight
    pub fn tx_in_flight(&self) -> usize {
        self.tx.in_flight()
    }

    fn stop_queue(&self) {
        if !self.queue_stopped.swap(true, Ordering::AcqRel) {
            self.sink.request_queue_stop();
        }
    }

    fn wake_queue(&self) {
        if self.queue_stopped.swap(false, Ordering::AcqRel) {
            self.sink.request_queue_wake();
        }
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Process one completed bulk IN buffer
    ///
    /// Returns the number of records handled. Malformed records are counted
    /// as receive errors and skipped. Records before a framing error are
    /// still delivered; the rest of the buffer is dropped and the error
    /// returned.
    pub fn handle_rx(&self, buf: &[u8]) -> Result<usize> {
        let mut count = 0;
        for record in decode_records(buf, self.adapter.family) {
            match record {
                Ok(record) => {
                    self.dispatch(record);
                    count += 1;
                }
                Err(e @ IxxatError::MalformedRecord { .. }) => {
                    warn!("Channel {}: {}", self.index, e);
                    lock(&self.rx).monitor.stats_mut().rx_errors += 1;
                }
                Err(e) => {
                    error!("Channel {}: {}", self.index, e);
                    lock(&self.rx).monitor.stats_mut().rx_errors += 1;
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    fn dispatch(&self, record: Record) {
        match record {
            Record::Data {
                time,
                frame,
                overrun,
            } => {
                let timestamp_us = {
                    let mut rx = lock(&self.rx);
                    let stats = rx.monitor.stats_mut();
                    if overrun {
                        stats.rx_over_errors += 1;
                        stats.rx_errors += 1;
                    }
                    stats.rx_packets += 1;
                    stats.rx_bytes += frame.data().len() as u64;
                    rx.time_ref.observe(time)
                };
                if overrun {
                    warn!("Channel {}: receive overrun", self.index);
                }
                self.sink.deliver_frame(frame, timestamp_us);
            }
            Record::Status { status, .. } => {
                let outcome = lock(&self.rx).monitor.on_status(status);
                if outcome.bus_off {
                    self.sink.on_bus_off();
                }
                if let Some(record) = outcome.record {
                    self.sink.deliver_error(record);
                }
            }
            Record::Error {
                code,
                rx_errors,
                tx_errors,
                ..
            } => {
                let record = lock(&self.rx).monitor.on_error(code, rx_errors, tx_errors);
                if let Some(record) = record {
                    self.sink.deliver_error(record);
                }
            }
            Record::TimeOverflow { time } => {
                lock(&self.rx).time_ref.observe(time);
            }
            Record::Info | Record::Wakeup | Record::TimerReset | Record::Unknown { .. } => {}
        }
    }
}

fn usb_error(e: rusb::Error) -> IxxatError {
    match e {
        rusb::Error::NoDevice => IxxatError::NoDevice,
        e => IxxatError::Usb(e),
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("adapter", &self.adapter.name)
            .field("index", &self.index)
            .field("endpoints", &self.endpoints)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("gone", &self.gone.load(Ordering::Relaxed))
            .field("tx_in_flight", &self.tx.in_flight())
            .finish()
    }
}
