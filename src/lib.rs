//! IXXAT USB-to-CAN Protocol Implementation for Rust
//!
//! This crate drives IXXAT USB-to-CAN adapters from the host side: the
//! vendor command protocol on the control endpoint, the bulk message
//! record format, and the per-channel lifecycle.
//!
//! # Features
//!
//! - Classic CAN (CL1 family) and CAN FD (CL2 family) adapters
//! - Bounded-retry command transport with chunked responses
//! - Bit timing calculation and controller init encoding
//! - Device timestamps reconciled to host time across timer wraps
//! - Controller state and bus error tracking
//! - Transmit backpressure through a fixed pool of in-flight transfers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ixxat_usb::{CanFrame, Event, EventQueue, IxxatUsb};
//!
//! fn main() -> ixxat_usb::Result<()> {
//!     let devices = IxxatUsb::scan()?;
//!     let Some(device) = devices.first() else {
//!         println!("No IXXAT USB device found");
//!         return Ok(());
//!     };
//!
//!     let (sink, events) = EventQueue::new();
//!     let sink = Arc::new(sink);
//!     let (dev, usb) = IxxatUsb::open(device, |_| sink.clone())?;
//!     println!("{}", dev);
//!
//!     // Configure bitrate (500 kbps) and start channel 0
//!     let ch = dev.channel(0)?;
//!     ch.set_bitrate(500_000)?;
//!     ch.open()?;
//!
//!     ch.transmit(&CanFrame::new(0x7FF, false, &[0x12, 0x34, 0x56, 0x78])?)?;
//!
//!     loop {
//!         usb.pump(ch, Duration::from_millis(100))?;
//!         while let Ok(event) = events.try_recv() {
//!             if let Event::Frame { frame, timestamp_us } = event {
//!                 println!("{:>16} RX  {}", timestamp_us, frame);
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! # Supported Devices
//!
//! - USB-to-CAN compact / embedded / professional / automotive (VID: 0x08D8)
//! - USB-to-CAN FD compact / professional / automotive / PCIe mini, USB-to-CAR
//! - CAN-IDM200
//! - CAN-IDM101

pub mod adapter;
pub mod channel;
pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod message;
pub mod sink;
pub mod state;
pub mod structures;
pub mod timestamp;
pub mod timing;
pub mod transport;
pub mod tx_pool;
pub mod usb;

// Re-export main types at crate root
pub use constants::{
    // CAN ID masks
    CAN_EFF_MASK,
    CAN_SFF_MASK,
    // Payload limits
    CANFD_MAX_DLEN,
    CAN_MAX_DLEN,
    // Vendor
    IXXAT_USB_VENDOR_ID,
};

pub use adapter::{Adapter, Endpoints, Family};
pub use channel::{Channel, Lifecycle, TxStatus};
pub use device::IxxatUsb;
pub use error::{ErrorKind, IxxatError, Result};
pub use frame::{CanFrame, FrameFormat};
pub use message::{decode_records, Record};
pub use sink::{Event, EventQueue, NetSink};
pub use state::{BusError, CanState, ChannelStats, ControllerFlags, ErrorCounters, ErrorRecord};
pub use structures::{DeviceCaps, DeviceInfo};
pub use timing::{BitTiming, BitTimingConst, CtrlMode};
pub use transport::{BulkTransport, CommandTransport, ControlPipe, TransferStatus, TransportConfig};
pub use tx_pool::{TxContextPool, TxToken};
pub use usb::RusbTransport;
