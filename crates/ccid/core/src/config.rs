//! Session configuration

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::crypto::Block;

/// Default supervision time for session creation
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lifetime of a partial frame
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pre-shared key used to open the secure channel
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureChannelConfig {
    /// AES-128 key, hex encoded in configuration files
    #[serde(with = "hex::serde")]
    pub key: Block,
    /// Key slot on the reader
    #[serde(default)]
    pub key_index: u8,
}

impl SecureChannelConfig {
    /// Create a secure channel configuration
    pub const fn new(key: Block, key_index: u8) -> Self {
        Self { key, key_index }
    }
}

impl fmt::Debug for SecureChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelConfig")
            .field("key", &"<redacted>")
            .field("key_index", &self.key_index)
            .finish()
    }
}

/// Configuration options for a CCID session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Open a secure channel during session creation
    pub secure_channel: Option<SecureChannelConfig>,

    /// Power cards found in the slots, at creation and on insertion
    pub auto_connect: bool,

    /// Read firmware revision and slot names during creation
    pub read_device_info: bool,

    /// Supervision timer for the whole creation phase
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// A partial frame older than this is dropped and the session fails
    #[serde(with = "duration_ms")]
    pub reassembly_timeout: Duration,

    /// Maximum wait for a response once creation is over
    #[serde(with = "option_duration_ms")]
    pub response_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secure_channel: None,
            auto_connect: true,
            read_device_info: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            response_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a secure channel with the given key
    pub fn with_secure_channel(mut self, secure_channel: SecureChannelConfig) -> Self {
        self.secure_channel = Some(secure_channel);
        self
    }

    /// Set whether cards are powered automatically
    pub const fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Set whether vendor information is read at creation
    pub const fn with_read_device_info(mut self, read_device_info: bool) -> Self {
        self.read_device_info = read_device_info;
        self
    }

    /// Set the creation supervision timer
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the partial frame lifetime
    pub const fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Set the response timeout
    pub const fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_some(&(duration.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
