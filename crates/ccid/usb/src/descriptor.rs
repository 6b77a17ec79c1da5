//! CCID class descriptor and interrupt message parsing

use bytes::Bytes;

/// USB interface class of smart card readers
pub const CCID_CLASS: u8 = 0x0B;

/// SpringCard USB vendor identifier
pub const SPRINGCARD_VID: u16 = 0x1C34;

/// Descriptor type of the CCID functional descriptor
const CCID_DESCRIPTOR_TYPE: u8 = 0x21;

/// `RDR_to_PC_NotifySlotChange`
pub const NOTIFY_SLOT_CHANGE: u8 = 0x50;

/// `RDR_to_PC_HardwareError`
pub const HARDWARE_ERROR: u8 = 0x51;

/// Number of slots announced by the CCID functional descriptor
///
/// `extra` holds the class specific bytes following the interface descriptor.
/// Several descriptors may be chained; the first one of type `0x21` wins.
pub fn slot_count(extra: &[u8]) -> Option<u8> {
    let mut rest = extra;
    while rest.len() >= 2 {
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            return None;
        }
        let (descriptor, tail) = rest.split_at(len);
        if descriptor[1] == CCID_DESCRIPTOR_TYPE {
            // bLength, bDescriptorType, bcdCCID (2), bMaxSlotIndex
            return descriptor.get(4).map(|max| max.saturating_add(1));
        }
        rest = tail;
    }
    None
}

/// Convert an interrupt IN message into status notification bytes
///
/// `NotifySlotChange` carries the same two bits per slot layout as the status
/// notification bitmap, only the leading slot count byte is missing.
pub fn slot_change_to_status(message: &[u8], slot_count: u8) -> Option<Bytes> {
    let (&kind, bitmap) = message.split_first()?;
    if kind != NOTIFY_SLOT_CHANGE {
        return None;
    }

    let needed = (slot_count as usize).div_ceil(4);
    if bitmap.len() < needed {
        return None;
    }

    let mut status = Vec::with_capacity(1 + needed);
    status.push(slot_count);
    status.extend_from_slice(&bitmap[..needed]);
    Some(Bytes::from(status))
}
