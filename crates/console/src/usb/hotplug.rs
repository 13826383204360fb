//! Hotplug watcher and session dispatcher
//!
//! Hotplug callbacks run inside the event pump and must not block, so they
//! only enqueue a [`SessionEvent`]. A single `usb-session` thread drains the
//! queue and applies the events to the session controller one at a time, in
//! the order the callbacks fired.
//!
//! When the host cannot deliver hotplug notifications the watcher runs
//! degraded: it makes one open attempt at start and never reacts to plugging
//! afterwards.

use crate::config::ConfigProvider;
use crate::reader::ReaderControl;
use crate::usb::session::{OpenOutcome, SessionController};
use crate::usb::transport::Transport;
use crate::usb::worker::{EventPump, spawn_event_pump};
use common::{EventReceiver, EventSender, SessionEvent, create_session_channel};
use protocol::{Result, UsbError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// How device presence is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugMode {
    /// Arrival and departure callbacks are registered
    Callbacks,
    /// No hotplug support; one open attempt was made at start
    Degraded,
}

/// Everything the dispatcher needs to act on an event
struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    controller: Arc<SessionController<T>>,
    reader: Arc<ReaderControl>,
    config: Arc<dyn ConfigProvider>,
}

/// Running hotplug registration, event pump and dispatcher
pub struct HotplugWatcher<T: Transport> {
    mode: HotplugMode,
    events: EventSender,
    registration: Option<T::Registration>,
    pump: Option<EventPump>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<T: Transport> HotplugWatcher<T> {
    /// Start watching for the controller's device
    ///
    /// The dispatcher is running before the callback is registered, and the
    /// callback is registered before the event pump starts, so the arrival
    /// enumerated for an already connected device is never lost.
    pub fn start(
        transport: Arc<T>,
        controller: Arc<SessionController<T>>,
        reader: Arc<ReaderControl>,
        config: Arc<dyn ConfigProvider>,
    ) -> Result<Self> {
        let identity = *controller.identity();
        let (events, receiver) = create_session_channel();

        let dispatcher = Dispatcher {
            transport: Arc::clone(&transport),
            controller,
            reader,
            config,
        };
        let dispatcher = std::thread::Builder::new()
            .name("usb-session".to_string())
            .spawn(move || dispatcher.run(receiver))
            .map_err(|e| UsbError::Hotplug(format!("failed to spawn session thread: {e}")))?;

        let mut watcher = Self {
            mode: HotplugMode::Degraded,
            events,
            registration: None,
            pump: None,
            dispatcher: Some(dispatcher),
        };

        let registration = if transport.has_hotplug() {
            match transport.register_hotplug(&identity, watcher.events.clone()) {
                Ok(registration) => Some(registration),
                Err(e) => {
                    warn!("Hotplug registration failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        match registration {
            Some(registration) => {
                watcher.registration = Some(registration);
                // On failure `watcher` is dropped, which deregisters and joins
                let pump = spawn_event_pump(transport).map_err(|e| {
                    UsbError::Hotplug(format!("failed to spawn event pump: {e}"))
                })?;
                watcher.pump = Some(pump);
                watcher.mode = HotplugMode::Callbacks;
                info!("Watching for {} via hotplug callbacks", identity);
            }
            None => {
                warn!(
                    "Hotplug is not available; {} will only be picked up if connected now",
                    identity
                );
                watcher
                    .events
                    .notify(SessionEvent::DeviceArrived {
                        vendor_id: identity.vendor_id,
                        product_id: identity.product_id,
                    })
                    .map_err(|e| UsbError::Hotplug(e.to_string()))?;
            }
        }

        Ok(watcher)
    }

    pub fn mode(&self) -> HotplugMode {
        self.mode
    }

    /// Whether device plugging is no longer being tracked
    ///
    /// True in degraded mode and after the event pump died.
    pub fn is_degraded(&self) -> bool {
        self.mode == HotplugMode::Degraded
            || self.pump.as_ref().is_some_and(EventPump::has_failed)
    }

    /// Stop the pump, deregister the callback and wait for the dispatcher
    ///
    /// Events queued before the stop are still applied. The session itself is
    /// left as it is; closing it is up to the caller.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }

        // No callback can fire once the pump has exited
        if self.registration.take().is_some() {
            debug!("Hotplug callback deregistered");
        }

        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        if let Err(e) = self.events.send_blocking(SessionEvent::Shutdown) {
            debug!("Session dispatcher already gone: {}", e);
        }
        if dispatcher.join().is_err() {
            error!("Session dispatcher thread panicked");
        }
    }
}

impl<T: Transport> Drop for HotplugWatcher<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport> Dispatcher<T> {
    fn run(self, events: EventReceiver) {
        debug!("Session dispatcher started");

        loop {
            match events.recv_blocking() {
                Ok(SessionEvent::DeviceArrived {
                    vendor_id,
                    product_id,
                }) => {
                    if self.controller.identity().matches(vendor_id, product_id) {
                        self.device_arrived();
                    }
                }
                Ok(SessionEvent::DeviceLeft {
                    vendor_id,
                    product_id,
                }) => {
                    if self.controller.identity().matches(vendor_id, product_id) {
                        self.device_left();
                    }
                }
                Ok(SessionEvent::Shutdown) | Err(_) => break,
            }
        }

        debug!("Session dispatcher stopped");
    }

    fn device_arrived(&self) {
        let identity = self.controller.identity();
        info!("{} connected", identity);

        // The stale session is torn down by the reopen
        if self.controller.is_open() {
            self.reader.disable();
        }

        let baud_rate = self.config.baud_rate();
        match self.controller.open_session(&self.transport, baud_rate) {
            Ok(OpenOutcome::Opened { baud_rate }) => {
                self.reader.enable();
                info!("USBasp console active at {} baud", baud_rate);
            }
            Ok(OpenOutcome::NotPresent) => {
                self.reader.disable();
                info!("{} is not connected", identity);
            }
            Err(e) => {
                self.reader.disable();
                error!("Failed to open {}: {}", identity, e);
            }
        }
    }

    fn device_left(&self) {
        let identity = self.controller.identity();
        info!("{} disconnected", identity);

        // Stop reading before the handle goes away
        self.reader.disable();
        match self.controller.close_session() {
            Ok(true) => debug!("Session on {} closed after departure", identity),
            Ok(false) => debug!("No session open on {}", identity),
            Err(e) => warn!("Error closing session on {}: {}", identity, e),
        }
    }
}
