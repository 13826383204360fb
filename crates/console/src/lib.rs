//! USBasp serial console
//!
//! Watches for a USBasp programmer, claims it when it is plugged in and
//! forwards the text its UART receives to a [`ConsoleSink`].
//!
//! The host builds one [`Console`] and drives it through
//! [`Console::settings_changed`] (or `start_session`/`stop_session`) and
//! [`Console::shutdown`].

pub mod app;
pub mod config;
pub mod reader;
pub mod sink;
pub mod testing;
pub mod usb;

pub use app::{Console, TransportFactory};
pub use config::{ConfigProvider, ConsoleConfig, SharedConfig};
pub use reader::{ByteSource, POLL_INTERVAL, Reader, ReaderControl, SHUTDOWN_TIMEOUT};
pub use sink::{ConsoleSink, WriterSink};
