//! Slot status interpretation
//!
//! Two sources report the state of a slot:
//!
//! - the reader status notification, which packs four 2-bit [`SlotState`]s per byte
//!   after a leading slot-count byte, and
//! - the `bStatus`/`bError` bytes of every CCID response header, decoded into a
//!   [`HeaderStatus`] and an optional [`SlotError`].

use derive_more::Display;

use crate::error::ErrorCode;

/// Low-power bit of the first status notification byte
pub const LOW_POWER_FLAG: u8 = 0x80;

/// State of a slot as reported by a status notification
///
/// The two bits read `(changed << 1) | present`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[repr(u8)]
pub enum SlotState {
    /// No card, no change since the last notification
    #[default]
    Absent = 0,
    /// Card present, no change since the last notification
    Present = 1,
    /// Card has been removed
    Removed = 2,
    /// Card has been inserted
    Inserted = 3,
}

impl SlotState {
    /// Decode the two low bits of `bits`
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Absent,
            1 => Self::Present,
            2 => Self::Removed,
            _ => Self::Inserted,
        }
    }

    /// Whether a card sits in the slot
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present | Self::Inserted)
    }

    /// Whether this state reports a transition
    pub const fn is_change(&self) -> bool {
        matches!(self, Self::Removed | Self::Inserted)
    }
}

/// Card presence and power, bits 0-1 of the response `bStatus` byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IccStatus {
    /// Card present and powered
    PresentActive,
    /// Card present, not powered
    PresentInactive,
    /// No card
    Absent,
    /// Reserved for future use
    Reserved,
}

impl IccStatus {
    /// Whether a card sits in the slot
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::PresentActive | Self::PresentInactive)
    }

    /// Whether the card is powered
    pub const fn is_powered(&self) -> bool {
        matches!(self, Self::PresentActive)
    }
}

/// Command outcome, bits 6-7 of the response `bStatus` byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CommandStatus {
    /// Command processed without error
    Ok,
    /// Command failed, `bError` holds the reason
    Failed,
    /// Time extension requested
    TimeExtension,
    /// Reserved for future use
    Reserved,
}

/// Decoded `bStatus` byte of a CCID response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderStatus {
    /// Card presence and power
    pub icc: IccStatus,
    /// Command outcome
    pub command: CommandStatus,
}

impl HeaderStatus {
    /// Decode a `bStatus` byte
    pub const fn from_byte(status: u8) -> Self {
        let icc = match status & 0x03 {
            0 => IccStatus::PresentActive,
            1 => IccStatus::PresentInactive,
            2 => IccStatus::Absent,
            _ => IccStatus::Reserved,
        };
        let command = match (status >> 6) & 0x03 {
            0 => CommandStatus::Ok,
            1 => CommandStatus::Failed,
            2 => CommandStatus::TimeExtension,
            _ => CommandStatus::Reserved,
        };
        Self { icc, command }
    }

    /// Whether the command failed
    pub const fn is_failed(&self) -> bool {
        matches!(self.command, CommandStatus::Failed)
    }

    /// The reader asks for more time, the real answer follows
    pub const fn is_time_extension(&self) -> bool {
        matches!(self.command, CommandStatus::TimeExtension)
    }
}

/// Slot error reported in the `bError` byte of a failed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotError {
    /// Host aborted the current activity
    CmdAborted,
    /// Card did not respond until the end of the timeout
    IccMute,
    /// Parity error while talking to the card
    XfrParityError,
    /// Overrun error while talking to the card
    XfrOverrun,
    /// Hardware error
    HwError,
    /// Bad ATR TS byte
    BadAtrTs,
    /// Bad ATR TCK byte
    BadAtrTck,
    /// Card protocol not supported
    IccProtocolNotSupported,
    /// Card class not supported
    IccClassNotSupported,
    /// Procedure byte conflict
    ProcedureByteConflict,
    /// Deactivated protocol
    DeactivatedProtocol,
    /// Reader busy with an automatic sequence
    BusyWithAutoSequence,
    /// Slot busy with another command
    CmdSlotBusy,
    /// Error byte missing from the table
    Unknown(u8),
}

impl SlotError {
    /// Decode a `bError` byte.
    ///
    /// `CMD_NOT_SUPPORTED` (0x00) is treated as a successful no-op and yields `None`.
    pub const fn from_byte(error: u8) -> Option<Self> {
        Some(match error {
            0x00 => return None,
            0xFF => Self::CmdAborted,
            0xFE => Self::IccMute,
            0xFD => Self::XfrParityError,
            0xFC => Self::XfrOverrun,
            0xFB => Self::HwError,
            0xF8 => Self::BadAtrTs,
            0xF7 => Self::BadAtrTck,
            0xF6 => Self::IccProtocolNotSupported,
            0xF5 => Self::IccClassNotSupported,
            0xF4 => Self::ProcedureByteConflict,
            0xF3 => Self::DeactivatedProtocol,
            0xF2 => Self::BusyWithAutoSequence,
            0xE0 => Self::CmdSlotBusy,
            other => Self::Unknown(other),
        })
    }

    /// Raw `bError` value
    pub const fn to_byte(&self) -> u8 {
        match self {
            Self::CmdAborted => 0xFF,
            Self::IccMute => 0xFE,
            Self::XfrParityError => 0xFD,
            Self::XfrOverrun => 0xFC,
            Self::HwError => 0xFB,
            Self::BadAtrTs => 0xF8,
            Self::BadAtrTck => 0xF7,
            Self::IccProtocolNotSupported => 0xF6,
            Self::IccClassNotSupported => 0xF5,
            Self::ProcedureByteConflict => 0xF4,
            Self::DeactivatedProtocol => 0xF3,
            Self::BusyWithAutoSequence => 0xF2,
            Self::CmdSlotBusy => 0xE0,
            Self::Unknown(b) => *b,
        }
    }

    /// Error code surfaced to the application
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::IccMute => ErrorCode::CardMute,
            Self::CmdSlotBusy | Self::BusyWithAutoSequence => ErrorCode::Busy,
            _ => ErrorCode::CardCommunicationError,
        }
    }

    /// Human readable description
    pub const fn message(&self) -> &'static str {
        match self {
            Self::CmdAborted => "Command aborted",
            Self::IccMute => "Card mute",
            Self::XfrParityError => "Parity error during transfer",
            Self::XfrOverrun => "Overrun during transfer",
            Self::HwError => "Hardware error",
            Self::BadAtrTs => "Bad ATR TS",
            Self::BadAtrTck => "Bad ATR TCK",
            Self::IccProtocolNotSupported => "Card protocol not supported",
            Self::IccClassNotSupported => "Card class not supported",
            Self::ProcedureByteConflict => "Procedure byte conflict",
            Self::DeactivatedProtocol => "Deactivated protocol",
            Self::BusyWithAutoSequence => "Busy with automatic sequence",
            Self::CmdSlotBusy => "Slot busy",
            Self::Unknown(_) => "Unknown slot error",
        }
    }
}

impl std::fmt::Display for SlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.message(), self.to_byte())
    }
}
