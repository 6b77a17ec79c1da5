//! USB transport for SpringCard CCID readers
//!
//! Implements the [`Transport`](springcard_ccid::Transport) trait on top of
//! `rusb`: the CCID interface (class `0x0B`) is claimed directly, so no PC/SC
//! service or vendor driver is involved.
//!
//! ```no_run
//! use springcard_ccid::prelude::*;
//! use springcard_ccid_usb::UsbTransport;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UsbTransport::open(None)?;
//! let (tx, rx) = session_event_channel();
//! let handle = SessionHandle::spawn(Session::new(transport, SessionConfig::default(), forward_to(tx)))?;
//!
//! if let SessionEvent::SessionCreated(device) = rx.recv()? {
//!     println!("{} slot(s)", device.readers.len());
//! }
//! handle.disconnect()?;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod descriptor;
mod error;
mod reader;
mod transport;

pub use error::UsbError;
pub use reader::{UsbReader, find_reader, list_readers};
pub use rusb::Context;
pub use transport::UsbTransport;
