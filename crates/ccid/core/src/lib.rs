//! Client side CCID protocol stack for SpringCard readers
//!
//! This crate lets an application reach the smart cards of a SpringCard reader
//! without a PC/SC driver. It speaks CCID directly over a [`Transport`] (USB
//! bulk endpoints, BLE characteristics, ...).
//!
//! ## Overview
//!
//! - [`frame`]: 10-byte CCID header codec and reassembly of chunked frames
//! - [`secure_channel`]: AES-128 mutual authentication and per-frame CMAC + CBC protection
//! - [`handler`]: sequence numbers, single outstanding command, slot status interpretation
//! - [`session`]: the lifecycle state machine (connect, authenticate, read info,
//!   power cards, exchange commands, sleep, close) and its threaded actor
//!
//! ```no_run
//! # use springcard_ccid::prelude::*;
//! # fn demo<T: Transport + 'static>(transport: T) -> springcard_ccid::Result<()> {
//! let (tx, rx) = session_event_channel();
//! let session = Session::new(transport, SessionConfig::default(), forward_to(tx));
//! let handle = SessionHandle::spawn(session)?;
//!
//! while let Ok(event) = rx.recv() {
//!     if let SessionEvent::SessionCreated(device) = event {
//!         if device.readers[0].card_powered {
//!             handle.transmit(0, vec![0x00, 0xA4, 0x04, 0x00, 0x00])?;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod config;
pub mod device;
pub mod escape;
pub mod event;
pub mod frame;
pub mod handler;
pub mod secure_channel;
pub mod session;
pub mod status;
pub mod transport;

mod crypto;
mod error;

pub use config::{SecureChannelConfig, SessionConfig};
pub use crypto::{BLOCK_LEN, Block};
pub use device::{CcidServiceKind, Channel, Device, DeviceInfo, FirmwareVersion, Reader};
pub use error::{Error, ErrorCode, ErrorKind, Result, ResultExt};
pub use event::{SessionEvent, SessionObserver};
pub use frame::{CommandCode, Frame, Response, ResponseCode};
pub use handler::CcidHandler;
pub use session::{CreatingPhase, Request, Session, SessionHandle, SessionState};
pub use status::{HeaderStatus, SlotError, SlotState};
pub use transport::{Discovery, Transport, TransportError, TransportEvent, TransportSink};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Bytes, CcidServiceKind, Device, DeviceInfo, Error, Reader, Request, Result,
        SecureChannelConfig, Session, SessionConfig, SessionEvent, SessionHandle,
        SessionObserver, SessionState, SlotState,
        event::channel::{forward_to, session_event_channel},
        transport::{Discovery, Transport, TransportError, TransportEvent, TransportSink},
    };
}
