//! USB subsystem
//!
//! Everything between the host USB library and the reader loop:
//! - Transport seam and its rusb backend
//! - USBasp vendor protocol client
//! - Session controller owning the single claimed device
//! - Hotplug watcher, session dispatcher and event pump
//!
//! Blocking USB work runs on dedicated threads (`usb-event-pump`,
//! `usb-session`) so the async runtime in the binary never waits on libusb.

pub mod backend;
pub mod device;
pub mod hotplug;
pub mod session;
pub mod transport;
pub mod worker;

// Re-export public types
pub use backend::{RusbHandle, RusbTransport, map_rusb_error};
pub use device::UsbaspDevice;
pub use hotplug::{HotplugMode, HotplugWatcher};
pub use session::{OpenOutcome, SessionController, SessionState};
pub use transport::{Transport, UsbHandle};
pub use worker::{EVENT_SLICE, EventPump, spawn_event_pump};
