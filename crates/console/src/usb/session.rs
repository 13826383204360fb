//! Session controller
//!
//! Owns the single live device session. Every open/close transition runs in
//! full under one lock, and every read goes through the same lock, so a read
//! can never observe a half-closed handle: once the session is gone, reads
//! fail fast with [`UsbError::SessionClosed`] without touching the device.

use crate::usb::device::UsbaspDevice;
use crate::usb::transport::{Transport, UsbHandle};
use protocol::{DeviceIdentity, Result, TestCommand, UsbError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

/// Result of an open attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Interface claimed and baud rate applied
    Opened { baud_rate: u32 },
    /// No matching device connected; the controller stays closed
    NotPresent,
}

/// A claimed device
struct DeviceSession<H: UsbHandle> {
    device: UsbaspDevice<H>,
    claimed_interface: bool,
    detached_kernel_driver: bool,
    baud_rate: u32,
}

/// Serializes session transitions and device access
pub struct SessionController<T: Transport> {
    identity: DeviceIdentity,
    session: Mutex<Option<DeviceSession<T::Handle>>>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            session: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn lock(&self) -> MutexGuard<'_, Option<DeviceSession<T::Handle>>> {
        // Transitions never leave the slot half-updated, so a poisoned lock
        // still holds a consistent value
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        if self.lock().is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Baud rate applied to the live session
    pub fn baud_rate(&self) -> Option<u32> {
        self.lock().as_ref().map(|s| s.baud_rate)
    }

    /// Open a session on the tracked device
    ///
    /// A session that is already open is closed first, covering a second
    /// arrival before the previous departure was processed. On any failure
    /// the controller is left closed with nothing claimed.
    pub fn open_session(&self, transport: &T, baud_rate: u32) -> Result<OpenOutcome> {
        let mut slot = self.lock();

        if let Some(stale) = slot.take() {
            debug!("Closing stale session on {} before reopening", self.identity);
            if let Err(e) = teardown(stale, self.identity.interface) {
                warn!("Error closing stale session: {}", e);
            }
        }

        let Some(handle) = transport.open_by_identity(&self.identity)? else {
            debug!("Device {} not present", self.identity);
            return Ok(OpenOutcome::NotPresent);
        };

        let session = establish(handle, self.identity.interface, baud_rate)?;
        *slot = Some(session);

        info!("Opened session on {} at {} baud", self.identity, baud_rate);
        Ok(OpenOutcome::Opened { baud_rate })
    }

    /// Close the session if one is open
    ///
    /// Idempotent: returns `Ok(false)` when already closed. The controller is
    /// closed afterwards even when a cleanup step fails; the first such
    /// failure is returned.
    pub fn close_session(&self) -> Result<bool> {
        let mut slot = self.lock();
        let Some(session) = slot.take() else {
            return Ok(false);
        };

        let result = teardown(session, self.identity.interface);
        info!("Closed session on {}", self.identity);
        result.map(|()| true)
    }

    /// Re-apply a baud rate to the live session
    pub fn apply_baud_rate(&self, baud_rate: u32) -> Result<()> {
        let mut slot = self.lock();
        let session = slot.as_mut().ok_or(UsbError::SessionClosed)?;
        session.device.set_baud_rate(baud_rate)?;
        session.baud_rate = baud_rate;
        info!("Baud rate changed to {}", baud_rate);
        Ok(())
    }

    /// Run `f` against the live device while holding the session lock
    pub fn with_device<R>(
        &self,
        f: impl FnOnce(&UsbaspDevice<T::Handle>) -> Result<R>,
    ) -> Result<R> {
        let slot = self.lock();
        let session = slot.as_ref().ok_or(UsbError::SessionClosed)?;
        f(&session.device)
    }

    /// Drain the device's buffered UART bytes, see [`UsbaspDevice::get_string`]
    pub fn read_string(&self) -> Result<Option<String>> {
        self.with_device(|device| device.get_string())
    }

    pub fn test_command(&self, command: TestCommand) -> Result<Option<u8>> {
        self.with_device(|device| device.test_command(command))
    }
}

/// Claim the interface and configure the device, undoing partial work on error
fn establish<H: UsbHandle>(
    mut handle: H,
    interface: u8,
    baud_rate: u32,
) -> Result<DeviceSession<H>> {
    let mut detached_kernel_driver = false;
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface)?;
            detached_kernel_driver = true;
        }
        Ok(false) => {}
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
        }
    }

    if let Err(e) = handle.claim_interface(interface) {
        if detached_kernel_driver && let Err(reattach) = handle.attach_kernel_driver(interface) {
            warn!("Failed to reattach kernel driver after claim failure: {}", reattach);
        }
        return Err(e);
    }
    debug!("Claimed interface {}", interface);

    let session = DeviceSession {
        device: UsbaspDevice::new(handle),
        claimed_interface: true,
        detached_kernel_driver,
        baud_rate,
    };

    if let Err(e) = session.device.set_baud_rate(baud_rate) {
        if let Err(cleanup) = teardown(session, interface) {
            warn!("Cleanup after failed baud rate write also failed: {}", cleanup);
        }
        return Err(e);
    }

    Ok(session)
}

/// Release, reattach, close, in that order
fn teardown<H: UsbHandle>(session: DeviceSession<H>, interface: u8) -> Result<()> {
    let DeviceSession {
        device,
        claimed_interface,
        detached_kernel_driver,
        ..
    } = session;
    let mut handle = device.into_handle();
    let mut first_error = None;

    if claimed_interface {
        match handle.release_interface(interface) {
            Ok(()) => debug!("Released interface {}", interface),
            Err(e) => {
                warn!("Failed to release interface {}: {}", interface, e);
                first_error.get_or_insert(e);
            }
        }
    }

    if detached_kernel_driver {
        match handle.attach_kernel_driver(interface) {
            Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
            Err(e) => {
                warn!("Failed to reattach kernel driver to interface {}: {}", interface, e);
                first_error.get_or_insert(e);
            }
        }
    }

    drop(handle);

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, JournalEntry};
    use protocol::{TransferError, USBASP, commands};

    fn controller() -> SessionController<FakeTransport> {
        SessionController::new(USBASP)
    }

    #[test]
    fn test_open_absent_device_stays_closed() {
        let fake = FakeTransport::new();
        let ctl = controller();

        assert_eq!(ctl.open_session(&fake, 9600).unwrap(), OpenOutcome::NotPresent);
        assert_eq!(ctl.state(), SessionState::Closed);
        assert_eq!(fake.total_transfers(), 0);
    }

    #[test]
    fn test_open_claims_and_applies_baud_rate() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();

        assert_eq!(
            ctl.open_session(&fake, 9600).unwrap(),
            OpenOutcome::Opened { baud_rate: 9600 }
        );
        assert!(ctl.is_open());
        assert!(fake.is_claimed());
        assert_eq!(fake.baud_rate(), Some(9600));
        assert_eq!(ctl.baud_rate(), Some(9600));
    }

    #[test]
    fn test_close_is_idempotent() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();
        ctl.open_session(&fake, 9600).unwrap();

        assert!(ctl.close_session().unwrap());
        assert!(!ctl.close_session().unwrap());
        assert!(!ctl.close_session().unwrap());

        let journal = fake.journal();
        assert_eq!(journal.count(JournalEntry::InterfaceReleased), 1);
        assert_eq!(journal.count(JournalEntry::HandleClosed), 1);
        assert_eq!(fake.open_handles(), 0);
        assert_eq!(fake.leaked_claims(), 0);
    }

    #[test]
    fn test_close_reattaches_kernel_driver_after_release() {
        let fake = FakeTransport::new();
        fake.plug();
        fake.set_kernel_driver_active(true);
        let ctl = controller();

        ctl.open_session(&fake, 9600).unwrap();
        assert!(!fake.kernel_driver_active());

        ctl.close_session().unwrap();
        assert!(fake.kernel_driver_active());

        let journal = fake.journal();
        let released = journal.last_position(JournalEntry::InterfaceReleased).unwrap();
        let attached = journal.last_position(JournalEntry::KernelDriverAttached).unwrap();
        let closed = journal.last_position(JournalEntry::HandleClosed).unwrap();
        assert!(released < attached);
        assert!(attached < closed);
    }

    #[test]
    fn test_close_skips_reattach_when_not_detached() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();

        ctl.open_session(&fake, 9600).unwrap();
        ctl.close_session().unwrap();

        assert_eq!(fake.journal().count(JournalEntry::KernelDriverAttached), 0);
    }

    #[test]
    fn test_reopen_closes_stale_session_first() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();

        ctl.open_session(&fake, 9600).unwrap();
        ctl.open_session(&fake, 19200).unwrap();

        assert!(ctl.is_open());
        assert_eq!(ctl.baud_rate(), Some(19200));
        assert_eq!(fake.open_handles(), 1);
        assert_eq!(fake.leaked_claims(), 0);
        assert_eq!(fake.journal().count(JournalEntry::InterfaceClaimed), 2);
        assert_eq!(fake.journal().count(JournalEntry::InterfaceReleased), 1);
    }

    #[test]
    fn test_claim_failure_leaves_closed_and_restores_driver() {
        let fake = FakeTransport::new();
        fake.plug();
        fake.set_kernel_driver_active(true);
        fake.fail_claim(Some(TransferError::Busy));
        let ctl = controller();

        let err = ctl.open_session(&fake, 9600).unwrap_err();
        assert!(matches!(err, UsbError::Claim { .. }));
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(fake.kernel_driver_active());
        assert_eq!(fake.open_handles(), 0);
    }

    #[test]
    fn test_baud_rate_failure_rolls_back_claim() {
        let fake = FakeTransport::new();
        fake.plug();
        fake.fail_baud_rate(Some(TransferError::Pipe));
        let ctl = controller();

        let err = ctl.open_session(&fake, 9600).unwrap_err();
        assert_eq!(err, UsbError::Transfer(TransferError::Pipe));
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(!fake.is_claimed());
        assert_eq!(fake.leaked_claims(), 0);
        assert_eq!(fake.open_handles(), 0);
    }

    #[test]
    fn test_release_failure_still_closes() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();
        ctl.open_session(&fake, 9600).unwrap();

        fake.fail_release(Some(TransferError::NoDevice));
        let err = ctl.close_session().unwrap_err();
        assert!(matches!(err, UsbError::Release { .. }));
        assert_eq!(ctl.state(), SessionState::Closed);
        assert_eq!(fake.open_handles(), 0);
    }

    #[test]
    fn test_reads_after_close_fail_without_transfer() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();
        ctl.open_session(&fake, 9600).unwrap();
        ctl.close_session().unwrap();

        let before = fake.total_transfers();
        assert_eq!(ctl.read_string(), Err(UsbError::SessionClosed));
        assert_eq!(ctl.test_command(TestCommand::Cmd1), Err(UsbError::SessionClosed));
        assert_eq!(fake.total_transfers(), before);
    }

    #[test]
    fn test_apply_baud_rate_requires_open_session() {
        let fake = FakeTransport::new();
        fake.plug();
        let ctl = controller();

        assert_eq!(ctl.apply_baud_rate(4800), Err(UsbError::SessionClosed));

        ctl.open_session(&fake, 9600).unwrap();
        ctl.apply_baud_rate(4800).unwrap();
        assert_eq!(fake.baud_rate(), Some(4800));
        assert_eq!(ctl.baud_rate(), Some(4800));
        assert_eq!(fake.transfer_count(commands::UART_SETBAUDRATE), 2);
    }
}
