//! In-memory model of a connected reader device
//!
//! A [`Device`] is created when a session reaches the creation phase and torn down
//! when it closes. Its [`Reader`]s (one per slot) are only mutated by the session
//! state machine.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use derive_more::Display;

use crate::error::{Error, Result};
use crate::status::{HeaderStatus, SlotState};

/// Flavour of CCID service found during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum CcidServiceKind {
    /// Plain service, no pairing required
    #[default]
    Plain,
    /// Bonded service, link level pairing required
    Bonded,
}

/// Vendor metadata read at discovery
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Vendor name
    pub vendor_name: String,
    /// Product name
    pub product_name: String,
    /// Serial number
    pub serial_number: String,
    /// Hardware revision, when exposed
    pub hardware_revision: Option<String>,
}

/// Firmware revision, `"MM.mm-bb-gXXXXX"` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Build number
    pub build: u16,
    /// Source revision
    pub commit: String,
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        const INVALID: Error = Error::Protocol("Invalid firmware revision string");

        let mut parts = s.trim().splitn(3, '-');
        let version = parts.next().ok_or(INVALID)?;
        let build = parts.next().ok_or(INVALID)?;
        let commit = parts.next().unwrap_or_default();

        let (major, minor) = version.split_once('.').ok_or(INVALID)?;

        Ok(Self {
            major: major.parse().map_err(|_| INVALID)?,
            minor: minor.parse().map_err(|_| INVALID)?,
            build: build.parse().map_err(|_| INVALID)?,
            commit: commit.trim_start_matches('g').to_string(),
        })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}.{:02}-{:02}", self.major, self.minor, self.build)?;
        if !self.commit.is_empty() {
            write!(f, "-g{}", self.commit)?;
        }
        Ok(())
    }
}

/// Card channel of a slot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Channel {
    /// Answer-To-Reset of the powered card
    pub atr: Bytes,
}

/// One slot of the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reader {
    /// Slot index
    pub index: u8,
    /// Slot name, read from the device when available
    pub name: String,
    /// Last state reported by a status notification
    pub slot_state: SlotState,
    /// A card sits in the slot
    pub card_present: bool,
    /// The card has been powered by this session
    pub card_connected: bool,
    /// The card is powered
    pub card_powered: bool,
    /// Card channel
    pub channel: Channel,
}

impl Reader {
    /// Create an empty slot
    pub fn new(index: u8) -> Self {
        Self {
            index,
            name: format!("Slot {index}"),
            slot_state: SlotState::Absent,
            card_present: false,
            card_connected: false,
            card_powered: false,
            channel: Channel::default(),
        }
    }

    /// Apply a notification state. Returns `true` when the state is a transition
    /// worth reporting.
    pub(crate) fn apply_slot_state(&mut self, state: SlotState) -> bool {
        self.slot_state = state;
        self.card_present = state.is_present();
        match state {
            SlotState::Absent | SlotState::Removed => self.lose_card(),
            // A new card, nothing carries over from the previous one
            SlotState::Inserted => self.card_disconnected(),
            SlotState::Present => {}
        }
        state.is_change()
    }

    /// Apply the `bStatus` byte of a response addressed to this slot
    pub(crate) fn apply_header_status(&mut self, status: HeaderStatus) {
        self.card_present = status.icc.is_present();
        self.card_powered = status.icc.is_powered();
        if !self.card_present {
            self.lose_card();
        } else if !self.card_powered {
            self.card_connected = false;
            self.channel.atr = Bytes::new();
        }
    }

    /// Record a successful power-on
    pub(crate) fn card_connected(&mut self, atr: Bytes) {
        self.card_present = true;
        self.card_powered = true;
        self.card_connected = true;
        self.channel.atr = atr;
    }

    /// Record a power-off
    pub(crate) fn card_disconnected(&mut self) {
        self.card_powered = false;
        self.card_connected = false;
        self.channel.atr = Bytes::new();
    }

    fn lose_card(&mut self) {
        self.card_present = false;
        self.card_disconnected();
    }

    /// Whether session creation should power this slot
    pub const fn needs_power_on(&self) -> bool {
        self.card_present && !self.card_powered && !self.card_connected
    }
}

/// A connected reader device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Slots, ordered by index
    pub readers: Vec<Reader>,
    /// Device reports low-power mode
    pub is_sleeping: bool,
    /// Secure channel established
    pub is_secure: bool,
    /// Last fatal error seen on this device
    pub last_error: Option<Error>,
    /// Vendor metadata
    pub info: DeviceInfo,
    /// Firmware revision, when read
    pub firmware: Option<FirmwareVersion>,
    /// CCID service flavour
    pub service: CcidServiceKind,
}

impl Device {
    /// Create a device with `slot_count` empty slots
    pub fn new(info: DeviceInfo, service: CcidServiceKind, slot_count: u8) -> Self {
        Self {
            readers: (0..slot_count).map(Reader::new).collect(),
            is_sleeping: false,
            is_secure: false,
            last_error: None,
            info,
            firmware: None,
            service,
        }
    }

    /// Look up a slot
    pub fn reader(&self, slot: u8) -> Result<&Reader> {
        self.readers
            .get(slot as usize)
            .ok_or(Error::NoSuchSlot(slot))
    }

    /// Look up a slot mutably
    pub fn reader_mut(&mut self, slot: u8) -> Result<&mut Reader> {
        self.readers
            .get_mut(slot as usize)
            .ok_or(Error::NoSuchSlot(slot))
    }
}
