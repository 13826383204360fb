//! rusb transport backend
//!
//! Wraps a libusb context created through rusb. Errors are mapped into the
//! protocol taxonomy at this boundary so nothing above it depends on rusb.

use crate::usb::transport::{Transport, UsbHandle};
use common::{EventSender, SessionEvent};
use protocol::{ControlSetup, DeviceIdentity, Result, TransferError, UsbError};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Transport backed by a dedicated libusb context
pub struct RusbTransport {
    context: Context,
}

impl RusbTransport {
    /// Initialise a new libusb context
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| UsbError::Init(e.to_string()))?;
        debug!("libusb context initialised");
        Ok(Self { context })
    }
}

impl Transport for RusbTransport {
    type Handle = RusbHandle;
    type Registration = Registration<Context>;

    fn has_hotplug(&self) -> bool {
        rusb::has_hotplug()
    }

    fn open_by_identity(&self, identity: &DeviceIdentity) -> Result<Option<RusbHandle>> {
        let handle = self
            .context
            .open_device_with_vid_pid(identity.vendor_id, identity.product_id);
        Ok(handle.map(|handle| RusbHandle { handle }))
    }

    fn register_hotplug(
        &self,
        identity: &DeviceIdentity,
        events: EventSender,
    ) -> Result<Registration<Context>> {
        let callback = HotplugCallback {
            identity: *identity,
            events,
        };

        HotplugBuilder::new()
            .vendor_id(identity.vendor_id)
            .product_id(identity.product_id)
            .enumerate(true)
            .register(&self.context, Box::new(callback))
            .map_err(|e| UsbError::Hotplug(e.to_string()))
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.context
            .handle_events(Some(timeout))
            .map_err(|e| UsbError::Transfer(map_rusb_error(e)))
    }
}

/// Open USBasp handle
pub struct RusbHandle {
    handle: DeviceHandle<Context>,
}

impl UsbHandle for RusbHandle {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        if !rusb::supports_detach_kernel_driver() {
            return Ok(false);
        }
        self.handle
            .kernel_driver_active(interface)
            .map_err(|e| UsbError::KernelDriver {
                interface,
                reason: map_rusb_error(e),
            })
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        if !rusb::supports_detach_kernel_driver() {
            return Ok(());
        }
        self.handle
            .detach_kernel_driver(interface)
            .map_err(|e| UsbError::KernelDriver {
                interface,
                reason: map_rusb_error(e),
            })
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        if !rusb::supports_detach_kernel_driver() {
            return Ok(());
        }
        self.handle
            .attach_kernel_driver(interface)
            .map_err(|e| UsbError::KernelDriver {
                interface,
                reason: map_rusb_error(e),
            })
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        self.handle
            .claim_interface(interface)
            .map_err(|e| UsbError::Claim {
                interface,
                reason: map_rusb_error(e),
            })
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        self.handle
            .release_interface(interface)
            .map_err(|e| UsbError::Release {
                interface,
                reason: map_rusb_error(e),
            })
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let result = if setup.is_in() {
            self.handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buffer,
                timeout,
            )
        } else {
            self.handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buffer,
                timeout,
            )
        };

        result.map_err(|e| UsbError::Transfer(map_rusb_error(e)))
    }
}

/// Hot-plug callback handler
///
/// Runs inside `handle_events` on the event pump thread. It must not open
/// devices or block, so it only forwards a message to the session dispatcher.
struct HotplugCallback {
    identity: DeviceIdentity,
    events: EventSender,
}

impl HotplugCallback {
    /// Read vendor/product ids, `None` when the device is not ours
    fn ids<T: UsbContext>(&self, device: &Device<T>) -> Option<(u16, u16)> {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                warn!(
                    "Unable to read device descriptor (bus={}, addr={}): {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return None;
            }
        };

        let (vid, pid) = (desc.vendor_id(), desc.product_id());
        self.identity.matches(vid, pid).then_some((vid, pid))
    }

    fn forward(&self, event: SessionEvent) {
        if let Err(e) = self.events.notify(event) {
            error!("Failed to queue hotplug event: {}", e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some((vendor_id, product_id)) = self.ids(&device) {
            self.forward(SessionEvent::DeviceArrived {
                vendor_id,
                product_id,
            });
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some((vendor_id, product_id)) = self.ids(&device) {
            self.forward(SessionEvent::DeviceLeft {
                vendor_id,
                product_id,
            });
        }
    }
}

/// Map rusb errors to protocol transfer errors
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Io => TransferError::Io,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::Access => TransferError::Access,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::NotFound => TransferError::NotFound,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Pipe => TransferError::Pipe,
        rusb::Error::Interrupted => TransferError::Interrupted,
        rusb::Error::NoMem => TransferError::NoMem,
        rusb::Error::NotSupported => TransferError::NotSupported,
        _ => TransferError::Other,
    }
}
