//! Error types for the IXXAT USB library
//!
//! Transport and protocol failures are reported through [`IxxatError`]. Bus
//! errors signalled by the controller itself are not errors at this level;
//! they arrive as [`crate::state::ErrorRecord`] notifications.

use thiserror::Error;

/// Result type alias for IXXAT USB operations
pub type Result<T> = std::result::Result<T, IxxatError>;

/// Stable classification of every [`IxxatError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Allocation failed on the host or the device
    OutOfMemory,
    /// I/O failure, possibly transient
    Io,
    /// The device answered with something that does not fit the protocol
    Malformed,
    /// The device is gone
    NoDevice,
    /// Requested feature or device is not supported
    Unsupported,
}

/// Error types for IXXAT USB operations
#[derive(Error, Debug)]
pub enum IxxatError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Control transfer kept failing until the retry bound was hit
    #[error("Control transfer failed after {attempts} attempts: {source}")]
    ControlTransfer {
        attempts: u32,
        #[source]
        source: rusb::Error,
    },

    /// Device has been disconnected
    #[error("No such device")]
    NoDevice,

    /// Response size does not match what was declared or expected
    #[error("Malformed response from device: expected {expected} bytes, got {actual}")]
    MalformedResponse { expected: usize, actual: usize },

    /// Device executed the command and reported a failure
    #[error("Command 0x{code:03x} failed with result 0x{result:08x}")]
    CommandFailed { code: u32, result: u32 },

    /// Inbound buffer contains a record that overruns the buffer
    ///
    /// `decoded` counts the records decoded before the bad one.
    #[error("Framing error at offset {offset} ({remaining} bytes left, {decoded} records decoded)")]
    Framing {
        offset: usize,
        remaining: usize,
        decoded: usize,
    },

    /// Record fits the buffer but its content cannot be decoded
    #[error("Malformed record at offset {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: &'static str },

    /// No adapter descriptor for this product
    #[error("Unsupported device {vendor_id:04x}:{product_id:04x}")]
    UnknownProduct { vendor_id: u16, product_id: u16 },

    /// Controller mode bits the adapter cannot do
    #[error("Unsupported controller mode: 0x{0:08x}")]
    UnsupportedMode(u32),

    /// Adapter does not support CAN FD
    #[error("Device does not support CAN FD")]
    FdNotSupported,

    /// Bit timing parameter outside the adapter range
    #[error("Bit timing {param} = {value} out of range {min}..={max}")]
    InvalidBitTiming {
        param: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// No bit timing reaches the requested bitrate
    #[error("Unsupported bitrate {bitrate} for clock {clock_hz} Hz")]
    UnsupportedBitrate { bitrate: u32, clock_hz: u32 },

    /// Frame cannot be represented
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Encoded record does not fit the adapter transmit buffer
    #[error("Frame of {size} bytes exceeds transmit buffer of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Invalid channel number
    #[error("Invalid channel number: {channel} (device has {max_channels} channels)")]
    InvalidChannel { channel: u8, max_channels: u8 },

    /// Endpoint expected by the adapter is missing from the interface
    #[error("Endpoint 0x{0:02x} not present on the interface")]
    MissingEndpoint(u8),

    /// Channel opened before a bit timing was configured
    #[error("Bit timing not configured")]
    BitTimingNotSet,

    /// Channel is not open
    #[error("Channel is not open")]
    NotOpen,

    /// Channel configuration cannot change while it is open
    #[error("Channel is open")]
    Busy,
}

impl IxxatError {
    /// Map the error onto the stable set of error codes
    pub fn kind(&self) -> ErrorKind {
        match self {
            IxxatError::Usb(e) | IxxatError::ControlTransfer { source: e, .. } => usb_kind(*e),
            IxxatError::NoDevice => ErrorKind::NoDevice,
            IxxatError::MalformedResponse { .. }
            | IxxatError::CommandFailed { .. }
            | IxxatError::Framing { .. }
            | IxxatError::MalformedRecord { .. } => ErrorKind::Malformed,
            IxxatError::UnknownProduct { .. }
            | IxxatError::UnsupportedMode(_)
            | IxxatError::FdNotSupported
            | IxxatError::UnsupportedBitrate { .. }
            | IxxatError::MissingEndpoint(_)
            | IxxatError::InvalidBitTiming { .. }
            | IxxatError::InvalidFrame(_)
            | IxxatError::FrameTooLarge { .. }
            | IxxatError::InvalidChannel { .. }
            | IxxatError::BitTimingNotSet => ErrorKind::Unsupported,
            IxxatError::NotOpen | IxxatError::Busy => ErrorKind::Io,
        }
    }

    /// Check if the device has gone away
    pub fn is_no_device(&self) -> bool {
        self.kind() == ErrorKind::NoDevice
    }

    /// Check if a higher layer may retry the operation
    ///
    /// Malformed responses point at a firmware or format mismatch and are
    /// never worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IxxatError::ControlTransfer { .. }
                | IxxatError::Usb(rusb::Error::Timeout)
                | IxxatError::Usb(rusb::Error::Busy)
                | IxxatError::Usb(rusb::Error::Interrupted)
        )
    }
}

fn usb_kind(e: rusb::Error) -> ErrorKind {
    match e {
        rusb::Error::NoDevice => ErrorKind::NoDevice,
        rusb::Error::NoMem => ErrorKind::OutOfMemory,
        rusb::Error::NotSupported => ErrorKind::Unsupported,
        rusb::Error::Overflow => ErrorKind::Malformed,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(IxxatError::NoDevice.kind(), ErrorKind::NoDevice);
        assert_eq!(
            IxxatError::Usb(rusb::Error::NoDevice).kind(),
            ErrorKind::NoDevice
        );
        assert_eq!(
            IxxatError::MalformedResponse {
                expected: 16,
                actual: 12
            }
            .kind(),
            ErrorKind::Malformed
        );
        assert_eq!(
            IxxatError::MalformedRecord {
                offset: 14,
                reason: "record shorter than its DLC"
            }
            .kind(),
            ErrorKind::Malformed
        );
        assert_eq!(IxxatError::Usb(rusb::Error::NoMem).kind(), ErrorKind::OutOfMemory);
        assert_eq!(IxxatError::FdNotSupported.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_retryable() {
        let io = IxxatError::ControlTransfer {
            attempts: 10,
            source: rusb::Error::Timeout,
        };
        assert!(io.is_retryable());
        assert_eq!(io.kind(), ErrorKind::Io);

        let malformed = IxxatError::MalformedResponse {
            expected: 16,
            actual: 20,
        };
        assert!(!malformed.is_retryable());
    }
}
