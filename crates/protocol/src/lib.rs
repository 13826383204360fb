//! USBasp+ UART protocol
//!
//! This crate describes the vendor-defined control-transfer protocol spoken by a
//! USBasp programmer running the UART-forwarding firmware. Every exchange is a
//! single vendor IN control transfer on endpoint 0; there are no bulk endpoints.
//!
//! It provides the compiled-in device identity, the command codes, the request
//! layout for each command and the error taxonomy shared by the transport and the
//! session manager.
//!
//! # Example
//!
//! ```
//! use protocol::{USBASP, commands};
//!
//! assert_eq!(USBASP.vendor_id, 0x16c0);
//!
//! let setup = commands::set_baud_rate(115_200);
//! assert_eq!(setup.request, commands::UART_SETBAUDRATE);
//! assert_eq!(setup.value, 0xc200);
//! assert_eq!(setup.index, 0x0001);
//! ```

pub mod commands;
pub mod error;
pub mod types;

pub use commands::PROTOCOL_TIMEOUT;
pub use error::{Result, TransferError, UsbError};
pub use types::{ControlSetup, DeviceIdentity, TestCommand, USBASP};
