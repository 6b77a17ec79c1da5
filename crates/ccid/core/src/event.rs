//! Events emitted by a session

use bytes::Bytes;

use crate::device::Device;
use crate::error::Error;
use crate::status::{HeaderStatus, SlotState};

/// Session events, delivered in the order the session produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Creation finished, the session is idle
    SessionCreated(Device),
    /// A card was inserted or removed
    CardStatusChanged {
        /// Slot index
        slot: u8,
        /// New slot state
        state: SlotState,
    },
    /// A card has been powered
    CardConnected {
        /// Slot index
        slot: u8,
        /// Answer-To-Reset
        atr: Bytes,
    },
    /// A card has been powered off
    CardDisconnected {
        /// Slot index
        slot: u8,
    },
    /// Answer to a transmitted APDU
    TransmitResponse {
        /// Slot index
        slot: u8,
        /// Response APDU
        response: Bytes,
    },
    /// Answer to a control (escape) command, status byte included
    ControlResponse {
        /// Raw escape response
        response: Bytes,
    },
    /// Answer to an explicit slot status query
    SlotStatus {
        /// Slot index
        slot: u8,
        /// Decoded slot status
        status: HeaderStatus,
    },
    /// Non-fatal error scoped to a slot
    ReaderError {
        /// Slot index
        slot: u8,
        /// Error
        error: Error,
    },
    /// Reader entered or left low-power mode
    PowerStateChanged {
        /// Reader is sleeping
        sleeping: bool,
    },
    /// Fatal error, the session is closing
    SessionError(Error),
    /// The session is closed
    SessionClosed,
}

/// Receiver of session events
pub trait SessionObserver: Send {
    /// Handle one event
    fn on_event(&mut self, event: SessionEvent);
}

impl<F> SessionObserver for F
where
    F: FnMut(SessionEvent) + Send,
{
    fn on_event(&mut self, event: SessionEvent) {
        self(event)
    }
}

/// Channel based event delivery
pub mod channel {
    use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

    use super::{SessionEvent, SessionObserver};

    /// Sender for session events
    pub type SessionEventSender = Sender<SessionEvent>;
    /// Receiver for session events
    pub type SessionEventReceiver = Receiver<SessionEvent>;

    /// Create an unbounded channel for session events
    pub fn session_event_channel() -> (SessionEventSender, SessionEventReceiver) {
        unbounded()
    }

    /// Create a bounded channel with the specified capacity for session events
    pub fn bounded_session_event_channel(
        capacity: usize,
    ) -> (SessionEventSender, SessionEventReceiver) {
        bounded(capacity)
    }

    /// Observer forwarding every event into a channel
    pub fn forward_to(sender: SessionEventSender) -> impl SessionObserver {
        move |event: SessionEvent| {
            // Nobody listening any more
            let _ = sender.send(event);
        }
    }
}
