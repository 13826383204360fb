//! Session event channel between the USB event thread and the session dispatcher
//!
//! Hotplug callbacks run inside libusb's event handling and must return quickly,
//! so they only push a small message here. A single consumer drains the channel
//! and performs the (blocking) open/close transitions in order.

use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Capacity of the session event channel
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Events consumed by the session dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A device matching the hotplug filter appeared
    DeviceArrived {
        /// Vendor id read from the device descriptor
        vendor_id: u16,
        /// Product id read from the device descriptor
        product_id: u16,
    },

    /// A device matching the hotplug filter disappeared
    DeviceLeft {
        /// Vendor id read from the device descriptor
        vendor_id: u16,
        /// Product id read from the device descriptor
        product_id: u16,
    },

    /// Stop the dispatcher after everything queued before it
    Shutdown,
}

/// Producer side, cloned into hotplug callbacks
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
}

impl EventSender {
    /// Queue an event without blocking
    ///
    /// Used from hotplug callbacks, which must never stall the event thread.
    pub fn notify(&self, event: SessionEvent) -> crate::Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(ev) => crate::Error::ChannelFull(format!("{:?}", ev)),
            TrySendError::Closed(ev) => crate::Error::Channel(format!("closed, lost {:?}", ev)),
        })
    }

    /// Queue an event, waiting for space if needed
    pub fn send_blocking(&self, event: SessionEvent) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Consumer side, owned by the session dispatcher
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocking)
    ///
    /// Fails once every sender has been dropped and the queue is empty.
    pub fn recv_blocking(&self) -> crate::Result<SessionEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the session event channel
///
/// Returns (EventSender for hotplug callbacks, EventReceiver for the dispatcher)
pub fn create_session_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(SESSION_CHANNEL_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}
