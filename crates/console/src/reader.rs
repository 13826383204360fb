//! Console reader loop
//!
//! One thread for the whole process lifetime. While enabled it drains the
//! device into the sink, then sleeps up to [`POLL_INTERVAL`]; `enable`,
//! `disable` and shutdown wake it early. Session open/close cycles only flip
//! the enabled flag.

use crate::sink::ConsoleSink;
use crate::usb::session::SessionController;
use crate::usb::transport::Transport;
use protocol::Result;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Idle time between drains
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long [`Reader::shutdown`] waits by default
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Something the reader can drain text from
pub trait ByteSource: Send + Sync {
    /// `Ok(None)` when nothing is buffered right now
    fn read_string(&self) -> Result<Option<String>>;
}

impl<T: Transport> ByteSource for SessionController<T> {
    fn read_string(&self) -> Result<Option<String>> {
        SessionController::read_string(self)
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    enabled: bool,
    shutdown_requested: bool,
    /// Bumped on every change so a sleeping loop can tell it was poked
    generation: u64,
    finished: bool,
}

/// Shared flags between the reader thread and its controllers
#[derive(Debug, Default)]
pub struct ReaderControl {
    state: Mutex<ReaderState>,
    signal: Condvar,
}

impl ReaderControl {
    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut ReaderState)) {
        let mut state = self.lock();
        f(&mut state);
        state.generation += 1;
        self.signal.notify_all();
    }

    /// Start draining the device
    pub fn enable(&self) {
        self.update(|s| s.enabled = true);
    }

    /// Stop draining the device
    pub fn disable(&self) {
        self.update(|s| s.enabled = false);
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn request_shutdown(&self) {
        self.update(|s| s.shutdown_requested = true);
    }

    /// (enabled, generation, shutdown_requested)
    fn snapshot(&self) -> (bool, u64, bool) {
        let state = self.lock();
        (state.enabled, state.generation, state.shutdown_requested)
    }

    /// Sleep until something changes after `generation`, or `timeout` passes
    fn wait_for_change(&self, generation: u64, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .signal
            .wait_timeout_while(guard, timeout, |s| {
                s.generation == generation && !s.shutdown_requested
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn mark_finished(&self) {
        let mut state = self.lock();
        state.finished = true;
        self.signal.notify_all();
    }

    /// Wait until the reader thread has exited its loop
    fn wait_finished(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (state, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |s| !s.finished)
            .unwrap_or_else(PoisonError::into_inner);
        state.finished
    }
}

/// Handle to the reader thread
pub struct Reader {
    control: Arc<ReaderControl>,
    thread: Option<JoinHandle<()>>,
}

impl Reader {
    /// Spawn the reader thread, initially disabled
    pub fn spawn<S>(source: Arc<S>, sink: Box<dyn ConsoleSink>) -> io::Result<Self>
    where
        S: ByteSource + ?Sized + 'static,
    {
        let control = Arc::new(ReaderControl::default());
        let thread_control = Arc::clone(&control);

        let thread = std::thread::Builder::new()
            .name("console-reader".to_string())
            .spawn(move || run_reader(&thread_control, &*source, sink))?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    pub fn control(&self) -> Arc<ReaderControl> {
        Arc::clone(&self.control)
    }

    pub fn enable(&self) {
        self.control.enable();
    }

    pub fn disable(&self) {
        self.control.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Ask the reader to stop and wait up to `timeout` for it
    ///
    /// Returns `false` if the thread did not finish in time; it is then left
    /// to exit on its own, since an in-flight transfer cannot be cancelled.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        self.control.request_shutdown();
        if !self.control.wait_finished(timeout) {
            warn!("Console reader did not stop within {:?}", timeout);
            return false;
        }

        if thread.join().is_err() {
            warn!("Console reader thread panicked");
        }
        true
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown(SHUTDOWN_TIMEOUT);
        }
    }
}

fn run_reader<S>(control: &ReaderControl, source: &S, mut sink: Box<dyn ConsoleSink>)
where
    S: ByteSource + ?Sized,
{
    info!("Console reader started");
    let mut was_enabled = false;

    loop {
        let (enabled, generation, shutdown) = control.snapshot();
        if shutdown {
            break;
        }

        if enabled {
            if !was_enabled {
                sink.activate();
            }
            drain(control, source, sink.as_mut());
            sink.content_changed();
        }
        was_enabled = enabled;

        control.wait_for_change(generation, POLL_INTERVAL);
    }

    if let Err(e) = sink.close() {
        warn!("Failed to close console sink: {}", e);
    }
    drop(sink);

    info!("Console reader stopped");
    control.mark_finished();
}

/// Forward everything the device has buffered right now
fn drain<S>(control: &ReaderControl, source: &S, sink: &mut dyn ConsoleSink)
where
    S: ByteSource + ?Sized,
{
    loop {
        let (enabled, _, shutdown) = control.snapshot();
        if !enabled || shutdown {
            return;
        }

        match source.read_string() {
            Ok(Some(text)) => {
                if !text.is_empty() {
                    forward(sink, &text);
                }
            }
            Ok(None) => return,
            Err(e) => {
                // Errors racing an unplug are expected once disabled
                if control.is_enabled() {
                    if e.is_transient() {
                        debug!("No data from device this cycle: {}", e);
                    } else {
                        warn!(error = %e, "Error reading data from device");
                    }
                }
                return;
            }
        }
    }
}

fn forward(sink: &mut dyn ConsoleSink, text: &str) {
    if let Err(e) = sink.write(text).and_then(|()| sink.flush()) {
        warn!(error = %e, "Failed to write device output to console");
    }
}
