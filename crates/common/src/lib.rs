//! Common utilities for usbasp-console
//!
//! This crate provides the plumbing shared by the console library and binary:
//! error handling, logging setup, and the channel that carries hotplug
//! notifications from the USB event thread to the session dispatcher.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{EventReceiver, EventSender, SessionEvent, create_session_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
