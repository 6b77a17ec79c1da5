//! Core error type for all CCID session operations
//!
//! Every variant maps onto an [`ErrorKind`], which decides how the session state
//! machine reacts: transport, protocol and authentication errors close the session,
//! card errors are reported against a slot and usage errors are returned to the
//! caller without touching the session.

use std::time::Duration;

use derive_more::Display;

use crate::status::SlotError;
use crate::transport::TransportError;

/// Result type for CCID operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// Link to the device failed
    Transport,
    /// Malformed, oversized or mismatched frames
    Protocol,
    /// Secure channel handshake or frame protection failed
    Authentication,
    /// Error scoped to one slot or card
    Card,
    /// API misuse: busy, invalid slot, wrong state
    Usage,
}

impl ErrorKind {
    /// Whether an error of this kind terminates the session
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport | Self::Protocol | Self::Authentication)
    }
}

/// Error codes surfaced to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorCode {
    /// Device not connected
    DeviceNotConnected,
    /// CCID service (or USB interface) not found
    MissingService,
    /// CCID characteristic (or USB endpoint) not found
    MissingCharacteristic,
    /// Reading from the device failed
    ReadCharacteristicFailed,
    /// Writing to the device failed
    WriteCharacteristicFailed,
    /// Malformed dialog with the device
    ProtocolError,
    /// Unexpected dialog sequence
    DialogError,
    /// Device exposes no slot
    DummyDevice,
    /// Secure channel authentication failed
    AuthenticationError,
    /// Secure channel frame protection failed
    SecureCommunicationError,
    /// Slot index out of range
    NoSuchSlot,
    /// No card in the slot
    CardAbsent,
    /// Card does not answer
    CardMute,
    /// Card removed during the operation
    CardRemoved,
    /// Card communication failed
    CardCommunicationError,
    /// A command is already in progress
    Busy,
}

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    //
    // Transport related errors
    //
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    //
    // Protocol related errors
    //
    /// Buffer shorter than a CCID header
    #[error("Frame too short: {0} bytes, a CCID header needs 10")]
    FrameTooShort(usize),

    /// Received more bytes than the header declares
    #[error("Frame length mismatch: declared {declared} bytes, received {received}")]
    LengthMismatch {
        /// Payload length from the header
        declared: usize,
        /// Payload bytes actually received
        received: usize,
    },

    /// Declared length above what any reader may send
    #[error("Oversized frame: {0} bytes declared")]
    Oversized(usize),

    /// Response code does not match the command sent
    #[error("Unexpected response 0x{response:02X} to command 0x{command:02X}")]
    UnexpectedResponse {
        /// Response code received
        response: u8,
        /// Command code sent
        command: u8,
    },

    /// Response sequence number does not match the command sent
    #[error("Sequence mismatch: expected {expected}, received {received}")]
    SequenceMismatch {
        /// Sequence number of the command
        expected: u8,
        /// Sequence number of the response
        received: u8,
    },

    /// Response addressed to another slot than the command sent
    #[error("Slot mismatch: expected {expected}, received {received}")]
    SlotMismatch {
        /// Slot of the command
        expected: u8,
        /// Slot of the response
        received: u8,
    },

    /// Status notification slot count differs from the known reader count
    #[error("Slot count mismatch: {expected} known, device reports {reported}")]
    SlotCountMismatch {
        /// Known reader count
        expected: usize,
        /// Reader count in the notification
        reported: usize,
    },

    /// Device reports zero slots
    #[error("Device exposes no slot")]
    DummyDevice,

    /// Frame received while no command was outstanding
    #[error("Unsolicited frame")]
    Unsolicited,

    /// Partial frame never completed
    #[error("Incomplete frame discarded after {0:?}")]
    ReassemblyTimeout(Duration),

    /// No response to the outstanding command
    #[error("No response received within {0:?}")]
    ResponseTimeout(Duration),

    /// Other protocol violation
    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    //
    // Secure channel related errors
    //
    /// Mutual authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(&'static str),

    /// Deciphered payload lacks the 0x80 terminator
    #[error("Secure channel padding error")]
    Padding,

    /// CMAC verification failed
    #[error("Secure channel MAC verification failed")]
    Mac,

    //
    // Usage errors
    //
    /// Slot number does not fit a CCID header
    #[error("Invalid slot number: {0}")]
    InvalidSlot(usize),

    /// A command is already outstanding
    #[error("A command is already pending")]
    Busy,

    /// Slot index out of range for this device
    #[error("No such slot: {0}")]
    NoSuchSlot(u8),

    /// Device is in low-power mode
    #[error("Device is sleeping, only control commands are allowed")]
    Sleeping,

    /// Operation not allowed in the current session state
    #[error("Operation not allowed while {0}")]
    InvalidState(&'static str),

    /// Session actor stopped
    #[error("Session actor is not running")]
    ActorStopped,

    //
    // Card errors
    //
    /// No card in the slot
    #[error("No card in slot {0}")]
    CardAbsent(u8),

    /// Card present but not powered
    #[error("Card in slot {0} is not powered")]
    CardNotPowered(u8),

    /// Card removed while in use
    #[error("Card removed from slot {0}")]
    CardRemoved(u8),

    /// Slot error reported by the reader
    #[error("Slot {slot}: {error}")]
    Card {
        /// Slot index
        slot: u8,
        /// Reader supplied reason
        error: SlotError,
    },

    //
    // General errors
    //
    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },

    /// Generic dynamic error with string message
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new error with a dynamic message
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Message(message.into())
    }

    /// Create a new protocol error
    pub const fn protocol(message: &'static str) -> Self {
        Self::Protocol(message)
    }

    /// Create a new authentication error
    pub const fn authentication(message: &'static str) -> Self {
        Self::Authentication(message)
    }

    /// Taxonomy of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::FrameTooShort(_)
            | Self::LengthMismatch { .. }
            | Self::Oversized(_)
            | Self::UnexpectedResponse { .. }
            | Self::SequenceMismatch { .. }
            | Self::SlotMismatch { .. }
            | Self::SlotCountMismatch { .. }
            | Self::DummyDevice
            | Self::Unsolicited
            | Self::ReassemblyTimeout(_)
            | Self::ResponseTimeout(_)
            | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Authentication(_) | Self::Padding | Self::Mac => ErrorKind::Authentication,
            Self::InvalidSlot(_)
            | Self::Busy
            | Self::NoSuchSlot(_)
            | Self::Sleeping
            | Self::InvalidState(_)
            | Self::ActorStopped
            | Self::Message(_) => ErrorKind::Usage,
            Self::CardAbsent(_)
            | Self::CardNotPowered(_)
            | Self::CardRemoved(_)
            | Self::Card { .. } => ErrorKind::Card,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Whether this error terminates the session
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Application facing error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(e) => e.code(),
            Self::DummyDevice => ErrorCode::DummyDevice,
            Self::UnexpectedResponse { .. }
            | Self::SequenceMismatch { .. }
            | Self::SlotMismatch { .. }
            | Self::Unsolicited
            | Self::ResponseTimeout(_) => ErrorCode::DialogError,
            Self::FrameTooShort(_)
            | Self::LengthMismatch { .. }
            | Self::Oversized(_)
            | Self::SlotCountMismatch { .. }
            | Self::ReassemblyTimeout(_)
            | Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Authentication(_) => ErrorCode::AuthenticationError,
            Self::Padding | Self::Mac => ErrorCode::SecureCommunicationError,
            Self::InvalidSlot(_) | Self::NoSuchSlot(_) => ErrorCode::NoSuchSlot,
            Self::Busy | Self::Sleeping | Self::InvalidState(_) => ErrorCode::Busy,
            Self::ActorStopped | Self::Message(_) => ErrorCode::DeviceNotConnected,
            Self::CardAbsent(_) => ErrorCode::CardAbsent,
            Self::CardRemoved(_) => ErrorCode::CardRemoved,
            Self::CardNotPowered(_) => ErrorCode::CardCommunicationError,
            Self::Card { error, .. } => error.code(),
            Self::Context { source, .. } => source.code(),
        }
    }
}

/// Extension trait for Result with CCID Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn context<S: Into<String>>(self, context: S) -> Self {
        self.map_err(|e| e.with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert!(Error::Transport(TransportError::NotConnected).is_fatal());
        assert!(Error::DummyDevice.is_fatal());
        assert!(Error::Mac.is_fatal());
        assert!(!Error::Busy.is_fatal());
        assert!(!Error::CardAbsent(0).is_fatal());
        assert_eq!(
            Error::Card {
                slot: 1,
                error: SlotError::IccMute
            }
            .code(),
            ErrorCode::CardMute
        );
    }

    #[test]
    fn test_context_keeps_kind() {
        let result: Result<()> = Err(Error::Padding);
        let err = result.context("decrypting response").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.code(), ErrorCode::SecureCommunicationError);
        assert_eq!(
            err.to_string(),
            "decrypting response: Secure channel padding error"
        );
    }
}
