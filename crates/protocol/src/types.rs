//! Core protocol types

use std::fmt;

/// Identity of the peripheral the console talks to
///
/// Matching is done on vendor and product id; the interface number is the one
/// claimed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Interface claimed while a session is open
    pub interface: u8,
}

/// The USBasp programmer (VOTI shared VID/PID, interface 0)
pub const USBASP: DeviceIdentity = DeviceIdentity {
    vendor_id: 5824,
    product_id: 1500,
    interface: 0,
};

impl DeviceIdentity {
    /// Whether a device with the given descriptor ids is this peripheral
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (interface {})",
            self.vendor_id, self.product_id, self.interface
        )
    }
}

/// Setup stage of a control transfer
///
/// The data stage buffer and timeout are supplied separately by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest (the USBasp command code)
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl ControlSetup {
    /// Whether the data stage flows from device to host
    pub fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }
}

/// Diagnostic commands understood by the USBasp+ firmware
///
/// Each one makes the programmer blink its LEDs in a distinct pattern and
/// answers with a single status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestCommand {
    Cmd1,
    Cmd2,
    Cmd3,
}

impl TestCommand {
    /// Firmware command code
    pub fn code(self) -> u8 {
        match self {
            TestCommand::Cmd1 => crate::commands::TEST_CMD1,
            TestCommand::Cmd2 => crate::commands::TEST_CMD2,
            TestCommand::Cmd3 => crate::commands::TEST_CMD3,
        }
    }

    /// Look up a test command by its user-facing number (1..=3)
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(TestCommand::Cmd1),
            2 => Some(TestCommand::Cmd2),
            3 => Some(TestCommand::Cmd3),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usbasp_identity() {
        assert_eq!(USBASP.vendor_id, 0x16c0);
        assert_eq!(USBASP.product_id, 0x05dc);
        assert_eq!(USBASP.interface, 0);
    }

    #[test]
    fn test_identity_matches() {
        assert!(USBASP.matches(5824, 1500));
        assert!(!USBASP.matches(5824, 1501));
        assert!(!USBASP.matches(0x1234, 1500));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(USBASP.to_string(), "16c0:05dc (interface 0)");
    }

    #[test]
    fn test_control_setup_direction() {
        let setup = ControlSetup {
            request_type: 0xc0,
            request: 52,
            value: 52,
            index: 0,
        };
        assert!(setup.is_in());

        let setup = ControlSetup {
            request_type: 0x40,
            ..setup
        };
        assert!(!setup.is_in());
    }

    #[test]
    fn test_test_command_numbers() {
        assert_eq!(TestCommand::from_number(1), Some(TestCommand::Cmd1));
        assert_eq!(TestCommand::from_number(3), Some(TestCommand::Cmd3));
        assert_eq!(TestCommand::from_number(0), None);
        assert_eq!(TestCommand::from_number(4), None);
        assert_eq!(TestCommand::Cmd2.code(), 62);
    }
}
