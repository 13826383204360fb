//! Wire-shape tests for the USBasp vendor requests
//!
//! Every request must go out as a vendor/device/IN control transfer whose
//! value carries the command (simple requests) or the split baud rate.

use protocol::commands::{
    self, BAUD_RATE_REPLY_LEN, REQUEST_TYPE_VENDOR_IN, SIMPLE_REPLY_LEN, UART_GETBYTE,
    UART_GETBYTECOUNT, UART_SETBAUDRATE,
};
use protocol::{ControlSetup, PROTOCOL_TIMEOUT, TestCommand, TransferError, USBASP, UsbError};
use std::time::Duration;

#[test]
fn test_usbasp_identity() {
    assert_eq!(USBASP.vendor_id, 5824);
    assert_eq!(USBASP.product_id, 1500);
    assert_eq!(USBASP.interface, 0);
    assert!(USBASP.matches(0x16c0, 0x05dc));
    assert!(!USBASP.matches(0x16c0, 0x05dd));
}

#[test]
fn test_all_requests_are_vendor_in() {
    let requests = [
        commands::get_byte_count(),
        commands::get_byte(),
        commands::set_baud_rate(9600),
        commands::test_command(TestCommand::Cmd1),
        commands::test_command(TestCommand::Cmd2),
        commands::test_command(TestCommand::Cmd3),
    ];
    for setup in requests {
        assert_eq!(setup.request_type, REQUEST_TYPE_VENDOR_IN);
        assert!(setup.is_in());
    }
    assert_eq!(REQUEST_TYPE_VENDOR_IN, 0xc0);
}

#[test]
fn test_simple_requests_echo_command_in_value() {
    assert_eq!(
        commands::get_byte_count(),
        ControlSetup {
            request_type: 0xc0,
            request: UART_GETBYTECOUNT,
            value: u16::from(UART_GETBYTECOUNT),
            index: 0,
        }
    );
    assert_eq!(commands::get_byte().request, UART_GETBYTE);
    assert_eq!(commands::get_byte().value, 51);

    for (command, code) in [
        (TestCommand::Cmd1, 61),
        (TestCommand::Cmd2, 62),
        (TestCommand::Cmd3, 63),
    ] {
        let setup = commands::test_command(command);
        assert_eq!(setup.request, code);
        assert_eq!(setup.value, u16::from(code));
        assert_eq!(setup.index, 0);
    }
}

#[test]
fn test_baud_rate_request_words() {
    let setup = commands::set_baud_rate(9600);
    assert_eq!(setup.request, UART_SETBAUDRATE);
    assert_eq!(setup.value, 9600);
    assert_eq!(setup.index, 0);

    let setup = commands::set_baud_rate(1_000_000);
    assert_eq!(setup.value, 0x4240);
    assert_eq!(setup.index, 0x000f);
    assert_eq!(commands::join_baud_rate(setup.value, setup.index), 1_000_000);
}

#[test]
fn test_protocol_constants() {
    assert_eq!(PROTOCOL_TIMEOUT, Duration::from_secs(5));
    assert_eq!(SIMPLE_REPLY_LEN, 4);
    assert_eq!(BAUD_RATE_REPLY_LEN, 100);
}

#[test]
fn test_error_taxonomy() {
    let claim = UsbError::Claim {
        interface: 0,
        reason: TransferError::Busy,
    };
    assert!(!claim.is_transient());

    let timeout = UsbError::from(TransferError::Timeout);
    assert!(timeout.is_transient());
    assert!(timeout.to_string().contains("-7"));

    assert!(!UsbError::Transfer(TransferError::NoDevice).is_transient());
    assert!(!UsbError::SessionClosed.is_transient());
    assert_eq!(TransferError::from_code(-4), TransferError::NoDevice);
}
