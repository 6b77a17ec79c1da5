//! Transport traits for CCID communication with readers
//!
//! A transport moves raw CCID bytes between the host and a reader (BLE GATT
//! characteristics, USB bulk endpoints, ...). It has no knowledge of frames,
//! sequence numbers or the secure channel.
//!
//! Outbound calls go through [`Transport`]. Inbound traffic is pushed into a
//! [`TransportSink`] handed over on [`Transport::connect`], which routes it onto the
//! session's single serialized queue. Worker threads owned by a transport must only
//! ever talk to the session through that sink.

pub mod error;

use std::{fmt, sync::Arc};

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

use crate::device::{CcidServiceKind, DeviceInfo};

/// Trait for reader transports
pub trait Transport: Send + fmt::Debug {
    /// Open the link, discover the CCID service and subscribe to notifications.
    ///
    /// Completion is reported asynchronously with [`TransportEvent::Connected`].
    fn connect(&mut self, sink: TransportSink) -> Result<(), TransportError>;

    /// Start closing the link; completion is reported with
    /// [`TransportEvent::Disconnected`].
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Release every resource immediately, without further events
    fn close(&mut self);

    /// Send raw bytes to the reader
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        trace!(data = %hex::encode(data), "Writing raw bytes");
        let result = self.do_write(data);
        if let Err(e) = &result {
            debug!(error = ?e, "Transport error during write");
        }
        result
    }

    /// Internal implementation of write
    /// This is the method that concrete implementations should override
    fn do_write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Largest chunk a single write may carry, `None` when unlimited
    fn max_write_len(&self) -> Option<usize> {
        None
    }
}

/// Result of the transport specific discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Vendor, product and serial metadata
    pub info: DeviceInfo,
    /// Flavour of CCID service found on the device
    pub service: CcidServiceKind,
    /// Number of slots exposed by the reader
    pub slot_count: u8,
    /// Initial status bytes, when the transport can read them at connect time
    pub status: Option<Bytes>,
}

/// Inbound transport events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link up, discovery done and notifications subscribed
    Connected(Discovery),
    /// Link down
    Disconnected,
    /// Bytes received on the response channel, possibly a fragment of a frame
    DataReceived(Bytes),
    /// Status notification (`[slot count | low power, slot bitmap...]`)
    StatusNotification(Bytes),
    /// Link level failure
    Error(TransportError),
}

/// Sink receiving inbound transport events
#[derive(Clone)]
pub struct TransportSink {
    deliver: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink").finish_non_exhaustive()
    }
}

impl TransportSink {
    /// Create a sink from a delivery function
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Create a sink that drops every event
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Deliver an event
    pub fn send(&self, event: TransportEvent) {
        (self.deliver)(event)
    }
}

impl From<crossbeam_channel::Sender<TransportEvent>> for TransportSink {
    fn from(sender: crossbeam_channel::Sender<TransportEvent>) -> Self {
        Self::new(move |event| {
            // A closed receiver means the session is gone
            let _ = sender.send(event);
        })
    }
}
