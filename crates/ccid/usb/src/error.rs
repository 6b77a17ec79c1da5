//! Error types for the USB transport

use springcard_ccid::TransportError;

/// USB specific errors
#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    /// libusb error
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No CCID reader attached
    #[error("No CCID reader found")]
    NoReader,

    /// No reader matches the requested name or serial number
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// Interface lacks a required endpoint
    #[error("Missing {0} endpoint")]
    MissingEndpoint(&'static str),

    /// Short bulk write
    #[error("Incomplete write: {written}/{expected} bytes")]
    IncompleteWrite {
        /// Bytes accepted by the device
        written: usize,
        /// Bytes submitted
        expected: usize,
    },

    /// Worker thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    /// Reader reported a hardware error on the interrupt endpoint
    #[error("Hardware error 0x{code:02X} on slot {slot}")]
    Hardware {
        /// Slot index
        slot: u8,
        /// Vendor error code
        code: u8,
    },
}

impl From<UsbError> for TransportError {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::Usb(rusb::Error::NoDevice) => Self::NotConnected,
            UsbError::Usb(rusb::Error::Timeout) => Self::Timeout,
            UsbError::NoReader | UsbError::ReaderNotFound(_) => Self::MissingService,
            UsbError::MissingEndpoint(kind) => Self::MissingCharacteristic(kind.into()),
            e @ UsbError::IncompleteWrite { .. } => Self::WriteFailed(e.to_string()),
            other => Self::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mapping() {
        assert_eq!(
            TransportError::from(UsbError::Usb(rusb::Error::NoDevice)),
            TransportError::NotConnected
        );
        assert_eq!(
            TransportError::from(UsbError::MissingEndpoint("bulk IN")),
            TransportError::MissingCharacteristic("bulk IN".into())
        );
        assert!(matches!(
            TransportError::from(UsbError::IncompleteWrite {
                written: 3,
                expected: 12
            }),
            TransportError::WriteFailed(_)
        ));
        assert_eq!(
            TransportError::from(UsbError::NoReader),
            TransportError::MissingService
        );
    }
}
