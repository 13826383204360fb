//! USBasp+ command set
//!
//! All commands are vendor requests addressed to the device with an IN data
//! stage, even the ones that only configure the firmware.

use crate::types::{ControlSetup, TestCommand};
use std::time::Duration;

/// Write one byte to the target's UART (reserved by the firmware, unused here)
pub const UART_PUTBYTE: u8 = 50;
/// Fetch one buffered UART byte
pub const UART_GETBYTE: u8 = 51;
/// Number of buffered UART bytes ready for fetching
pub const UART_GETBYTECOUNT: u8 = 52;
/// Configure the UART baud rate
pub const UART_SETBAUDRATE: u8 = 53;
/// Diagnostic blink commands
pub const TEST_CMD1: u8 = 61;
pub const TEST_CMD2: u8 = 62;
pub const TEST_CMD3: u8 = 63;

/// bmRequestType for vendor | device recipient | device-to-host
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0x40 | 0x00 | 0x80;

/// Timeout applied to every protocol transfer
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Data stage length for single-value commands
pub const SIMPLE_REPLY_LEN: usize = 4;
/// Data stage length for the baud rate command
pub const BAUD_RATE_REPLY_LEN: usize = 100;

/// Split a 32-bit baud rate into the (wValue, wIndex) pair the firmware expects
pub fn split_baud_rate(baud_rate: u32) -> (u16, u16) {
    (baud_rate as u16, (baud_rate >> 16) as u16)
}

/// Inverse of [`split_baud_rate`]
pub fn join_baud_rate(low: u16, high: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Request shape shared by every one-byte-answer command
///
/// The firmware echoes the command code in wValue.
pub fn simple(command: u8) -> ControlSetup {
    ControlSetup {
        request_type: REQUEST_TYPE_VENDOR_IN,
        request: command,
        value: u16::from(command),
        index: 0,
    }
}

pub fn get_byte_count() -> ControlSetup {
    simple(UART_GETBYTECOUNT)
}

pub fn get_byte() -> ControlSetup {
    simple(UART_GETBYTE)
}

pub fn test_command(command: TestCommand) -> ControlSetup {
    simple(command.code())
}

/// Baud rate configuration request
pub fn set_baud_rate(baud_rate: u32) -> ControlSetup {
    let (low, high) = split_baud_rate(baud_rate);
    ControlSetup {
        request_type: REQUEST_TYPE_VENDOR_IN,
        request: UART_SETBAUDRATE,
        value: low,
        index: high,
    }
}
