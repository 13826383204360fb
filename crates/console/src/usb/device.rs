//! USBasp+ protocol client
//!
//! Encodes the vendor commands on top of an open [`UsbHandle`] and exposes a
//! byte/string oriented read API plus the baud rate configuration write.

use crate::usb::transport::UsbHandle;
use protocol::commands::{self, BAUD_RATE_REPLY_LEN, SIMPLE_REPLY_LEN};
use protocol::{ControlSetup, PROTOCOL_TIMEOUT, Result, TestCommand};
use tracing::{debug, trace};

/// Protocol client bound to one open device handle
pub struct UsbaspDevice<H: UsbHandle> {
    handle: H,
}

impl<H: UsbHandle> UsbaspDevice<H> {
    pub fn new(handle: H) -> Self {
        Self { handle }
    }

    /// Give back the handle (closing it is the caller's job)
    pub fn into_handle(self) -> H {
        self.handle
    }

    /// Configure the UART baud rate
    ///
    /// Success means the transfer completed; the reply payload carries no
    /// contract.
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        let mut buffer = [0u8; BAUD_RATE_REPLY_LEN];
        let len = self.transfer(commands::set_baud_rate(baud_rate), &mut buffer)?;
        debug!("Baud rate set to {} ({} reply bytes)", baud_rate, len);
        Ok(())
    }

    /// Number of UART bytes buffered on the device
    ///
    /// 0 means nothing is available right now.
    pub fn byte_count(&self) -> Result<usize> {
        Ok(self
            .simple_command(commands::get_byte_count())?
            .map_or(0, usize::from))
    }

    /// Fetch one buffered byte
    ///
    /// `None` when the device answers with an empty payload, which happens when
    /// its buffer drained between the count and the fetch.
    pub fn get_byte(&self) -> Result<Option<u8>> {
        self.simple_command(commands::get_byte())
    }

    /// Drain the bytes currently buffered on the device
    ///
    /// Returns `None` when the device reports no buffered bytes, without
    /// fetching anything. Otherwise fetches exactly the reported number of
    /// bytes, stopping early (and returning what was read so far) if a fetch
    /// comes back empty.
    pub fn get_string(&self) -> Result<Option<String>> {
        let count = self.byte_count()?;
        if count == 0 {
            return Ok(None);
        }

        let mut text = String::with_capacity(count);
        for fetched in 0..count {
            match self.get_byte()? {
                Some(byte) => text.push(char::from(byte)),
                None => {
                    trace!("Device reported {} bytes but only {} arrived", count, fetched);
                    break;
                }
            }
        }

        Ok(Some(text))
    }

    /// Run a diagnostic blink command and return the status byte
    pub fn test_command(&self, command: TestCommand) -> Result<Option<u8>> {
        self.simple_command(commands::test_command(command))
    }

    /// One-byte-answer command; an empty reply is `None`
    fn simple_command(&self, setup: ControlSetup) -> Result<Option<u8>> {
        let mut buffer = [0u8; SIMPLE_REPLY_LEN];
        let len = self.transfer(setup, &mut buffer)?;
        Ok((len > 0).then_some(buffer[0]))
    }

    fn transfer(&self, setup: ControlSetup, buffer: &mut [u8]) -> Result<usize> {
        self.handle.control_transfer(setup, buffer, PROTOCOL_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use crate::usb::transport::Transport;
    use protocol::{TransferError, USBASP, UsbError};

    fn open(fake: &FakeTransport) -> UsbaspDevice<crate::testing::FakeHandle> {
        let handle = fake.open_by_identity(&USBASP).unwrap().unwrap();
        UsbaspDevice::new(handle)
    }

    #[test]
    fn test_get_string_without_data_skips_get_byte() {
        let fake = FakeTransport::new();
        fake.plug();
        let device = open(&fake);

        assert_eq!(device.get_string().unwrap(), None);
        assert_eq!(fake.transfer_count(commands::UART_GETBYTECOUNT), 1);
        assert_eq!(fake.transfer_count(commands::UART_GETBYTE), 0);
    }

    #[test]
    fn test_get_string_reads_exactly_count_bytes() {
        let fake = FakeTransport::new();
        fake.plug();
        fake.push_uart(b"ABCDE");
        fake.set_reported_count(Some(3));
        let device = open(&fake);

        assert_eq!(device.get_string().unwrap().as_deref(), Some("ABC"));
        assert_eq!(fake.transfer_count(commands::UART_GETBYTE), 3);
    }

    #[test]
    fn test_get_string_truncates_when_fetch_comes_back_empty() {
        let fake = FakeTransport::new();
        fake.plug();
        fake.push_uart(b"hi");
        fake.set_reported_count(Some(5));
        let device = open(&fake);

        assert_eq!(device.get_string().unwrap().as_deref(), Some("hi"));
        // Two bytes plus the empty fetch that ended the burst
        assert_eq!(fake.transfer_count(commands::UART_GETBYTE), 3);
    }

    #[test]
    fn test_get_string_maps_bytes_one_to_one() {
        let fake = FakeTransport::new();
        fake.plug();
        fake.push_uart(&[0x41, 0xe9, 0x0a]);
        let device = open(&fake);

        let text = device.get_string().unwrap().unwrap();
        assert_eq!(text.chars().count(), 3);
        assert_eq!(text, "A\u{e9}\n");
    }

    #[test]
    fn test_set_baud_rate_splits_words() {
        let fake = FakeTransport::new();
        fake.plug();
        let device = open(&fake);

        device.set_baud_rate(115_200).unwrap();
        assert_eq!(fake.baud_rate(), Some(115_200));
    }

    #[test]
    fn test_test_command_returns_first_byte() {
        let fake = FakeTransport::new();
        fake.plug();
        let device = open(&fake);

        assert_eq!(device.test_command(TestCommand::Cmd2).unwrap(), Some(62));
    }

    #[test]
    fn test_transfer_errors_propagate() {
        let fake = FakeTransport::new();
        fake.plug();
        let device = open(&fake);
        fake.fail_transfers(Some(TransferError::Pipe));

        assert_eq!(
            device.test_command(TestCommand::Cmd1),
            Err(UsbError::Transfer(TransferError::Pipe))
        );
        assert!(device.get_string().is_err());
    }
}
