//! Protocol error types
//!
//! `UsbError` is the taxonomy every USB-facing operation reports. Transfer
//! failures carry a [`TransferError`] that mirrors libusb status codes so callers
//! can tell "nothing to read right now" apart from a hard failure.

use thiserror::Error;

/// Status of a failed transfer
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("other error")]
    Other,
}

impl TransferError {
    /// libusb status code
    pub fn code(self) -> i32 {
        match self {
            TransferError::Io => -1,
            TransferError::InvalidParam => -2,
            TransferError::Access => -3,
            TransferError::NoDevice => -4,
            TransferError::NotFound => -5,
            TransferError::Busy => -6,
            TransferError::Timeout => -7,
            TransferError::Overflow => -8,
            TransferError::Pipe => -9,
            TransferError::Interrupted => -10,
            TransferError::NoMem => -11,
            TransferError::NotSupported => -12,
            TransferError::Other => -99,
        }
    }

    /// Build from a libusb status code, unknown codes become `Other`
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => TransferError::Io,
            -2 => TransferError::InvalidParam,
            -3 => TransferError::Access,
            -4 => TransferError::NoDevice,
            -5 => TransferError::NotFound,
            -6 => TransferError::Busy,
            -7 => TransferError::Timeout,
            -8 => TransferError::Overflow,
            -9 => TransferError::Pipe,
            -10 => TransferError::Interrupted,
            -11 => TransferError::NoMem,
            -12 => TransferError::NotSupported,
            _ => TransferError::Other,
        }
    }

    /// Failures that mean "no data this time" rather than a broken device
    pub fn is_transient(self) -> bool {
        matches!(self, TransferError::Timeout | TransferError::Interrupted)
    }
}

/// USB session errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// The host USB library could not be initialised
    #[error("Failed to initialise USB context: {0}")]
    Init(String),

    /// Interface busy or device gone while claiming
    #[error("Failed to claim interface {interface}: {reason}")]
    Claim { interface: u8, reason: TransferError },

    /// Interface could not be released
    #[error("Failed to release interface {interface}: {reason}")]
    Release { interface: u8, reason: TransferError },

    /// Kernel driver detach or reattach failed
    #[error("Kernel driver operation on interface {interface} failed: {reason}")]
    KernelDriver { interface: u8, reason: TransferError },

    /// A single control transfer failed
    #[error("Control transfer failed ({code}): {0}", code = .0.code())]
    Transfer(#[from] TransferError),

    /// No matching device is connected
    #[error("Device not present")]
    NotPresent,

    /// The operation needs an open session and there is none
    #[error("No device session is open")]
    SessionClosed,

    /// Hotplug registration or event handling failed
    #[error("Hotplug error: {0}")]
    Hotplug(String),
}

impl UsbError {
    /// Whether this error only means the device had nothing to say right now
    pub fn is_transient(&self) -> bool {
        matches!(self, UsbError::Transfer(e) if e.is_transient())
    }
}

/// Type alias for USB results
pub type Result<T> = std::result::Result<T, UsbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in -12..=-1 {
            assert_eq!(TransferError::from_code(code).code(), code);
        }
        assert_eq!(TransferError::from_code(-42), TransferError::Other);
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransferError::Timeout.is_transient());
        assert!(TransferError::Interrupted.is_transient());
        assert!(!TransferError::NoDevice.is_transient());
        assert!(!TransferError::Pipe.is_transient());

        assert!(UsbError::Transfer(TransferError::Timeout).is_transient());
        assert!(!UsbError::SessionClosed.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = UsbError::Transfer(TransferError::NoDevice);
        let msg = err.to_string();
        assert!(msg.contains("-4"));
        assert!(msg.contains("no such device"));

        let err = UsbError::Claim {
            interface: 0,
            reason: TransferError::Busy,
        };
        assert_eq!(err.to_string(), "Failed to claim interface 0: resource busy");
    }
}
