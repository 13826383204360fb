//! Owning context for the USBasp console
//!
//! [`Console`] is constructed once by the host and holds every long-lived
//! piece: the configuration provider, the session controller, the reader
//! thread and, while the feature is enabled, the USB runtime (transport
//! context plus hotplug watcher). The host drives it through the lifecycle
//! hooks [`start_session`](Console::start_session),
//! [`stop_session`](Console::stop_session) and
//! [`settings_changed`](Console::settings_changed).

use crate::config::ConfigProvider;
use crate::reader::{Reader, SHUTDOWN_TIMEOUT};
use crate::sink::ConsoleSink;
use crate::usb::hotplug::HotplugWatcher;
use crate::usb::session::SessionController;
use crate::usb::transport::Transport;
use protocol::{DeviceIdentity, Result, TestCommand, UsbError};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Creates a fresh transport context each time a session starts
pub type TransportFactory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Transport context and watcher, alive between start and stop
struct UsbRuntime<T: Transport> {
    transport: Arc<T>,
    watcher: HotplugWatcher<T>,
}

pub struct Console<T: Transport> {
    config: Arc<dyn ConfigProvider>,
    factory: TransportFactory<T>,
    controller: Arc<SessionController<T>>,
    reader: Reader,
    /// Held across start and stop so they never interleave
    runtime: Mutex<Option<UsbRuntime<T>>>,
}

impl<T: Transport> Console<T> {
    /// Build the context and spawn the (disabled) reader thread
    ///
    /// No USB resources are touched until [`start_session`](Self::start_session).
    pub fn new(
        identity: DeviceIdentity,
        config: Arc<dyn ConfigProvider>,
        factory: TransportFactory<T>,
        sink: Box<dyn ConsoleSink>,
    ) -> io::Result<Self> {
        let controller = Arc::new(SessionController::new(identity));
        let reader = Reader::spawn(Arc::clone(&controller), sink)?;

        Ok(Self {
            config,
            factory,
            controller,
            reader,
            runtime: Mutex::new(None),
        })
    }

    fn runtime(&self) -> MutexGuard<'_, Option<UsbRuntime<T>>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialise the transport and start watching for the device
    ///
    /// Does nothing when already started. A transport that fails to
    /// initialise leaves the feature disabled.
    pub fn start_session(&self) -> Result<()> {
        let mut runtime = self.runtime();
        if runtime.is_some() {
            debug!("USB session manager already running");
            return Ok(());
        }

        let transport = match (self.factory)() {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                error!(error = %e, "Failed to initialise USB; USBasp console disabled");
                return Err(e);
            }
        };

        let watcher = HotplugWatcher::start(
            Arc::clone(&transport),
            Arc::clone(&self.controller),
            self.reader.control(),
            Arc::clone(&self.config),
        )
        .inspect_err(|e| error!(error = %e, "Failed to start hotplug watcher"))?;

        *runtime = Some(UsbRuntime { transport, watcher });
        info!("USBasp console started for {}", self.controller.identity());
        Ok(())
    }

    /// Stop watching, close any open session and release the transport
    ///
    /// Does nothing when not started.
    pub fn stop_session(&self) {
        let mut runtime = self.runtime();
        let Some(UsbRuntime { transport, watcher }) = runtime.take() else {
            return;
        };

        // Drains queued events, so an arrival may still open and enable
        watcher.stop();
        self.reader.disable();

        match self.controller.close_session() {
            Ok(true) => debug!("Session closed on stop"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Error closing session on stop"),
        }

        // Last reference: tears down the USB context
        drop(transport);
        info!("USBasp console stopped");
    }

    /// React to a settings change from the host
    ///
    /// Starts or stops the session manager to follow the enabled flag, and
    /// re-applies the baud rate to an open session when it changed.
    pub fn settings_changed(&self) -> Result<()> {
        if !self.config.is_feature_enabled() {
            self.stop_session();
            return Ok(());
        }

        self.start_session()?;

        let wanted = self.config.baud_rate();
        match self.controller.baud_rate() {
            Some(applied) if applied != wanted => {
                match self.controller.apply_baud_rate(wanted) {
                    // Device left in between
                    Ok(()) | Err(UsbError::SessionClosed) => Ok(()),
                    Err(e) => {
                        warn!(error = %e, "Failed to apply baud rate {}", wanted);
                        Err(e)
                    }
                }
            }
            _ => Ok(()),
        }
    }

    /// Send a diagnostic blink command and return the first reply byte
    ///
    /// Fails with [`UsbError::SessionClosed`] when no session is open.
    pub fn test_command(&self, command: TestCommand) -> Result<Option<u8>> {
        self.controller.test_command(command)
    }

    /// Stop the reader, then the session manager
    ///
    /// Returns `false` if the reader did not finish within `timeout`; the
    /// session is torn down regardless.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.shutdown_inner(timeout)
    }

    fn shutdown_inner(&mut self, timeout: Duration) -> bool {
        let reader_stopped = self.reader.shutdown(timeout);
        self.stop_session();
        reader_stopped
    }

    /// Whether the session manager has been started
    pub fn is_running(&self) -> bool {
        self.runtime().is_some()
    }

    pub fn is_session_open(&self) -> bool {
        self.controller.is_open()
    }

    /// Whether the running watcher has lost (or never had) hotplug
    pub fn is_hotplug_degraded(&self) -> bool {
        self.runtime()
            .as_ref()
            .is_some_and(|runtime| runtime.watcher.is_degraded())
    }

    pub fn reader_enabled(&self) -> bool {
        self.reader.is_enabled()
    }

    pub fn controller(&self) -> &Arc<SessionController<T>> {
        &self.controller
    }
}

impl<T: Transport> Drop for Console<T> {
    fn drop(&mut self) {
        self.shutdown_inner(SHUTDOWN_TIMEOUT);
    }
}
