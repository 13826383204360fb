//! USB event pump
//!
//! libusb does not run threads of its own; hotplug callbacks are only
//! delivered while someone is inside `handle_events`. This dedicated thread
//! does that in bounded slices until it is told to stop.
//!
//! It must be started after the hotplug callback is registered and stopped
//! (aborted and joined) before the callback is deregistered.

use crate::usb::transport::Transport;
use protocol::UsbError;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Longest single blocking call into the USB library
pub const EVENT_SLICE: Duration = Duration::from_secs(1);

/// Running event pump
pub struct EventPump {
    abort: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Whether the pump died on an event handling error
    ///
    /// From that point on no hotplug notifications are delivered.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Abort the loop and wait for the thread to exit
    ///
    /// Takes at most one [`EVENT_SLICE`] once the current call returns.
    pub fn stop(mut self) {
        self.abort.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("USB event pump thread panicked");
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the event pump thread
pub fn spawn_event_pump<T: Transport>(transport: Arc<T>) -> io::Result<EventPump> {
    let abort = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(AtomicBool::new(false));

    let thread = {
        let abort = Arc::clone(&abort);
        let failed = Arc::clone(&failed);
        std::thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || {
                if let Err(e) = run_event_pump(&*transport, &abort) {
                    error!(
                        error = %e,
                        "USB event handling failed; hotplug unavailable until restart"
                    );
                    failed.store(true, Ordering::Release);
                }
            })?
    };

    Ok(EventPump {
        abort,
        failed,
        thread: Some(thread),
    })
}

fn run_event_pump<T: Transport>(transport: &T, abort: &AtomicBool) -> Result<(), UsbError> {
    info!("USB event pump started");

    while !abort.load(Ordering::Acquire) {
        transport.handle_events(EVENT_SLICE)?;
    }

    info!("USB event pump stopped");
    Ok(())
}
