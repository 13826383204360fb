//! Transport abstraction
//!
//! The seam between the session manager and the host USB library. The
//! production implementation is [`RusbTransport`](crate::usb::backend::RusbTransport);
//! tests inject [`FakeTransport`](crate::testing::FakeTransport).
//!
//! All calls are synchronous. Distinct handles may be used from different
//! threads, but calls on the same handle must be serialized by the caller; the
//! session controller does this with its session lock.

use common::EventSender;
use protocol::{ControlSetup, DeviceIdentity, Result};
use std::time::Duration;

/// An opened device
///
/// Dropping the handle closes it.
pub trait UsbHandle: Send + 'static {
    /// Whether a kernel driver is bound to the interface
    ///
    /// Returns `Ok(false)` on platforms that cannot tell.
    fn kernel_driver_active(&self, interface: u8) -> Result<bool>;

    /// Detach the kernel driver (no-op success where unsupported)
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()>;

    /// Reattach the kernel driver (no-op success where unsupported)
    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()>;

    fn claim_interface(&mut self, interface: u8) -> Result<()>;

    fn release_interface(&mut self, interface: u8) -> Result<()>;

    /// Run a control transfer and return the number of bytes in the data stage
    ///
    /// For IN requests the reply is written to `buffer`.
    fn control_transfer(
        &self,
        setup: ControlSetup,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;
}

/// An initialised host USB context
///
/// Dropping the transport tears the context down. Any hotplug registration
/// must be dropped first.
pub trait Transport: Send + Sync + 'static {
    type Handle: UsbHandle;

    /// Live hotplug registration; dropping it deregisters the callback
    type Registration: Send + 'static;

    /// Whether the platform can deliver hotplug notifications
    fn has_hotplug(&self) -> bool;

    /// Open the first device matching the identity, `None` when absent
    fn open_by_identity(&self, identity: &DeviceIdentity) -> Result<Option<Self::Handle>>;

    /// Register for arrival and departure of devices matching the identity
    ///
    /// Devices already connected are reported as arrivals during registration.
    /// Callbacks push onto `events` and never block.
    fn register_hotplug(
        &self,
        identity: &DeviceIdentity,
        events: EventSender,
    ) -> Result<Self::Registration>;

    /// Dispatch pending events, blocking at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}
