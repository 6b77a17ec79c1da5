//! Error types specific to reader transports

use crate::error::ErrorCode;

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Device not connected
    #[error("Device not connected")]
    NotConnected,

    /// CCID service or interface not found on the device
    #[error("CCID service not found")]
    MissingService,

    /// Characteristic or endpoint not found
    #[error("Missing characteristic or endpoint: {0}")]
    MissingCharacteristic(String),

    /// Read failure
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Write failure
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Supervision timer expired
    #[error("Operation timed out")]
    Timeout,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }

    /// Application facing error code
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotConnected | Self::Timeout | Self::Other(_) => ErrorCode::DeviceNotConnected,
            Self::MissingService => ErrorCode::MissingService,
            Self::MissingCharacteristic(_) => ErrorCode::MissingCharacteristic,
            Self::ReadFailed(_) => ErrorCode::ReadCharacteristicFailed,
            Self::WriteFailed(_) => ErrorCode::WriteCharacteristicFailed,
        }
    }
}
