//! Session lifecycle states
//!
//! ```text
//! Closed -> Creating(Connecting) -> Creating(Authenticating) -> Creating(ReadingInfo)
//!        -> Creating(ConnectingToCards) -> Idle
//! Idle <-> WritingCmdAndWaitingResp
//! Idle <-> Sleeping -> WakingUp -> Idle
//! any -> Closing -> Closed
//! ```

use derive_more::Display;

use crate::error::{Error, Result};

/// Sub-phase of session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum CreatingPhase {
    /// Waiting for the transport to connect and discover the reader
    Connecting,
    /// Secure channel handshake in progress
    Authenticating,
    /// Reading slot status, firmware revision and slot names
    ReadingInfo,
    /// Powering the cards already inserted
    ConnectingToCards,
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum SessionState {
    /// No link to the reader
    #[default]
    Closed,
    /// Session creation in progress
    #[display("Creating({_0})")]
    Creating(CreatingPhase),
    /// Ready for a command
    Idle,
    /// A command has been written, waiting for its response
    WritingCmdAndWaitingResp,
    /// Reader in low-power mode
    Sleeping,
    /// Wake-up command written, waiting for its response
    WakingUp,
    /// Link teardown in progress
    Closing,
}

impl SessionState {
    /// Short name, used in error messages
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Creating(_) => "creating",
            Self::Idle => "idle",
            Self::WritingCmdAndWaitingResp => "waiting for a response",
            Self::Sleeping => "sleeping",
            Self::WakingUp => "waking up",
            Self::Closing => "closing",
        }
    }

    /// Whether session creation is in progress
    pub const fn is_creating(&self) -> bool {
        matches!(self, Self::Creating(_))
    }

    /// Whether the session has been created and is still open
    pub const fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::WritingCmdAndWaitingResp | Self::Sleeping | Self::WakingUp
        )
    }

    /// Whether the link is gone or going
    pub const fn is_closing(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Check that moving to `next` is a legal transition
    pub fn validate_transition(&self, next: Self) -> Result<()> {
        use SessionState::*;

        let valid = match (*self, next) {
            (Closed, Creating(CreatingPhase::Connecting)) => true,
            (Creating(from), Creating(to)) => from <= to,
            (Creating(_), Idle | Sleeping) => true,
            (Idle, WritingCmdAndWaitingResp | Sleeping) => true,
            (WritingCmdAndWaitingResp, Idle | Sleeping | WritingCmdAndWaitingResp) => true,
            (Sleeping, WakingUp | Idle) => true,
            (WakingUp, Idle | Sleeping | WritingCmdAndWaitingResp) => true,
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing | Closed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidState(self.name()))
        }
    }
}
