//! CCID frame codec
//!
//! CCID messages consist of a 10-byte header followed by an optional payload:
//!
//! ```text
//! Offset  Size  Description
//! 0       1     Message type (command or response code)
//! 1       4     Payload length (little-endian), bit 7 of byte 4 flags a ciphered frame
//! 5       1     Slot number
//! 6       1     Sequence number
//! 7       1     Slot status (responses)
//! 8       1     Slot error (responses)
//! 9       1     Reserved
//! 10      N     Payload
//! ```
//!
//! Readers may deliver a response in several notifications. [`FrameBuffer`]
//! accumulates fragments until the received byte count matches the declared length.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::{Deref, Display};

use crate::error::{Error, Result};
use crate::status::{HeaderStatus, SlotError};

/// CCID header size in bytes
pub const HEADER_LEN: usize = 10;

/// Ciphered flag, bit 7 of header byte 4
pub const CIPHERED_FLAG: u8 = 0x80;

/// Largest payload a reader may declare (64 KiB APDU plus secure channel overhead)
pub const MAX_PAYLOAD_LEN: usize = 0x1_0000 + 32;

const LENGTH_MASK: u32 = 0x7FFF_FFFF;

/// Host to reader command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum CommandCode {
    /// `PC_to_RDR_IccPowerOn`
    IccPowerOn = 0x62,
    /// `PC_to_RDR_IccPowerOff`
    IccPowerOff = 0x63,
    /// `PC_to_RDR_GetSlotStatus`
    GetSlotStatus = 0x65,
    /// `PC_to_RDR_Escape`
    Escape = 0x6B,
    /// `PC_to_RDR_XfrBlock`
    XfrBlock = 0x6F,
}

impl CommandCode {
    /// Response code a reader answers this command with
    pub const fn expected_response(&self) -> ResponseCode {
        match self {
            Self::IccPowerOn | Self::XfrBlock => ResponseCode::DataBlock,
            Self::IccPowerOff | Self::GetSlotStatus => ResponseCode::SlotStatus,
            Self::Escape => ResponseCode::Escape,
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x62 => Ok(Self::IccPowerOn),
            0x63 => Ok(Self::IccPowerOff),
            0x65 => Ok(Self::GetSlotStatus),
            0x6B => Ok(Self::Escape),
            0x6F => Ok(Self::XfrBlock),
            _ => Err(Error::protocol("Unknown command code")),
        }
    }
}

/// Reader to host response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum ResponseCode {
    /// `RDR_to_PC_DataBlock`
    DataBlock = 0x80,
    /// `RDR_to_PC_SlotStatus`
    SlotStatus = 0x81,
    /// `RDR_to_PC_Escape`
    Escape = 0x83,
}

impl TryFrom<u8> for ResponseCode {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x80 => Ok(Self::DataBlock),
            0x81 => Ok(Self::SlotStatus),
            0x83 => Ok(Self::Escape),
            _ => Err(Error::protocol("Unknown response code")),
        }
    }
}

/// A CCID frame, command or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    code: u8,
    length: usize,
    ciphered: bool,
    slot: u8,
    sequence: u8,
    params: [u8; 3],
    payload: Bytes,
}

impl Frame {
    /// Create a command frame
    pub fn command(code: CommandCode, slot: u8, sequence: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(code as u8, slot, sequence, [0; 3], payload)
    }

    /// Create a response frame
    pub fn response(
        code: ResponseCode,
        slot: u8,
        sequence: u8,
        status: u8,
        error: u8,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(code as u8, slot, sequence, [status, error, 0], payload)
    }

    fn new(code: u8, slot: u8, sequence: u8, params: [u8; 3], payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            code,
            length: payload.len(),
            ciphered: false,
            slot,
            sequence,
            params,
            payload,
        }
    }

    /// Message type
    pub const fn code(&self) -> u8 {
        self.code
    }

    /// Payload length declared in the header
    pub const fn declared_length(&self) -> usize {
        self.length
    }

    /// Whether the ciphered flag is set
    pub const fn is_ciphered(&self) -> bool {
        self.ciphered
    }

    /// Slot number
    pub const fn slot(&self) -> u8 {
        self.slot
    }

    /// Sequence number
    pub const fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Header bytes 7 to 9
    pub const fn params(&self) -> [u8; 3] {
        self.params
    }

    /// Payload bytes
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the payload holds as many bytes as the header declares
    pub fn is_complete(&self) -> bool {
        self.payload.len() == self.length
    }

    /// Serialize the frame
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.code);
        let mut length = (self.payload.len() as u32 & LENGTH_MASK).to_le_bytes();
        if self.ciphered {
            length[3] |= CIPHERED_FLAG;
        }
        buf.put_slice(&length);
        buf.put_u8(self.slot);
        buf.put_u8(self.sequence);
        buf.put_slice(&self.params);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A frame received from the reader
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct Response(Frame);

impl Response {
    /// Wrap a decoded frame
    pub const fn new(frame: Frame) -> Self {
        Self(frame)
    }

    /// Response code, if known
    pub fn response_code(&self) -> Result<ResponseCode> {
        ResponseCode::try_from(self.0.code)
    }

    /// Raw `bStatus` byte
    pub const fn slot_status(&self) -> u8 {
        self.0.params[0]
    }

    /// Raw `bError` byte
    pub const fn slot_error(&self) -> u8 {
        self.0.params[1]
    }

    /// Decoded `bStatus` byte
    pub const fn header_status(&self) -> HeaderStatus {
        HeaderStatus::from_byte(self.slot_status())
    }

    /// Decoded `bError` byte, only meaningful on failed commands
    pub const fn header_error(&self) -> Option<SlotError> {
        SlotError::from_byte(self.slot_error())
    }

    /// Consume the response and return the inner frame
    pub fn into_frame(self) -> Frame {
        self.0
    }
}

/// Encode a command frame
pub fn encode(code: CommandCode, slot: u8, sequence: u8, payload: &[u8]) -> Bytes {
    Frame::command(code, slot, sequence, Bytes::copy_from_slice(payload)).to_bytes()
}

/// Decode a frame, whatever follows the header is taken as payload
pub fn decode(raw: &[u8]) -> Result<Frame> {
    if raw.len() < HEADER_LEN {
        return Err(Error::FrameTooShort(raw.len()));
    }

    Ok(Frame {
        code: raw[0],
        length: declared_length(raw)?,
        ciphered: is_ciphered(raw),
        slot: raw[5],
        sequence: raw[6],
        params: [raw[7], raw[8], raw[9]],
        payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
    })
}

/// Read the declared payload length, ciphered flag masked off
pub fn declared_length(raw: &[u8]) -> Result<usize> {
    match raw.get(1..5) {
        Some(field) => {
            let length = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
            Ok((length & LENGTH_MASK) as usize)
        }
        None => Err(Error::FrameTooShort(raw.len())),
    }
}

/// Whether the ciphered flag is set
pub fn is_ciphered(raw: &[u8]) -> bool {
    raw.get(4).is_some_and(|b| b & CIPHERED_FLAG != 0)
}

/// Rewrite the length field of a serialized frame
pub(crate) fn set_length(raw: &mut [u8], length: usize, ciphered: bool) {
    let mut field = (length as u32 & LENGTH_MASK).to_le_bytes();
    if ciphered {
        field[3] |= CIPHERED_FLAG;
    }
    raw[1..5].copy_from_slice(&field);
}

/// Outcome of feeding bytes into a [`FrameBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// More bytes are still arriving
    Incomplete,
    /// A whole frame is available
    Complete(Bytes),
}

/// Reassembles frames delivered in several chunks
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    started: Option<Instant>,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and check whether the frame is complete
    pub fn push(&mut self, chunk: &[u8]) -> Result<Assembly> {
        if self.buf.is_empty() {
            self.started = Some(Instant::now());
        }
        self.buf.extend_from_slice(chunk);

        if self.buf.len() < HEADER_LEN {
            return Ok(Assembly::Incomplete);
        }

        let declared = declared_length(&self.buf)?;
        if declared > MAX_PAYLOAD_LEN {
            self.clear();
            return Err(Error::Oversized(declared));
        }

        let received = self.buf.len() - HEADER_LEN;
        if received < declared {
            return Ok(Assembly::Incomplete);
        }
        if received > declared {
            self.clear();
            return Err(Error::LengthMismatch { declared, received });
        }

        self.started = None;
        Ok(Assembly::Complete(self.buf.split().freeze()))
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buf.clear();
        self.started = None;
    }

    /// Whether no partial frame is pending
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// When the pending partial frame started arriving
    pub const fn started_at(&self) -> Option<Instant> {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_encode_layout() {
        let raw = encode(CommandCode::XfrBlock, 1, 7, &hex!("00A4040000"));
        assert_eq!(raw.as_ref(), hex!("6F05000000010700000000A4040000"));
    }

    #[test]
    fn test_decode_roundtrip() {
        let payload = hex!("3B8F8001804F0CA000000306030001000000006A");
        let raw = encode(CommandCode::IccPowerOn, 3, 0xFE, &payload);
        let frame = decode(&raw).unwrap();

        assert_eq!(frame.code(), CommandCode::IccPowerOn as u8);
        assert_eq!(frame.slot(), 3);
        assert_eq!(frame.sequence(), 0xFE);
        assert_eq!(frame.payload().as_ref(), payload);
        assert!(frame.is_complete());
        assert!(!frame.is_ciphered());
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(decode(&hex!("800000")), Err(Error::FrameTooShort(3)));
        assert_eq!(declared_length(&hex!("80")), Err(Error::FrameTooShort(1)));
    }

    #[test]
    fn test_declared_length_masks_ciphered_flag() {
        let raw = hex!("80180000800000000000");
        assert_eq!(declared_length(&raw).unwrap(), 0x18);
        assert!(is_ciphered(&raw));

        let frame = decode(&raw).unwrap();
        assert!(frame.is_ciphered());
        assert!(!frame.is_complete());
    }

    #[test]
    fn test_response_accessors() {
        let raw = Frame::response(ResponseCode::SlotStatus, 0, 4, 0x42, 0xFE, Bytes::new()).to_bytes();
        let response = Response::new(decode(&raw).unwrap());

        assert_eq!(response.response_code().unwrap(), ResponseCode::SlotStatus);
        assert_eq!(response.slot_status(), 0x42);
        assert_eq!(response.slot_error(), 0xFE);
        assert!(response.header_status().is_failed());
        assert_eq!(response.header_error(), Some(SlotError::IccMute));
    }

    #[test]
    fn test_buffer_reassembles_chunks() {
        let raw = Frame::response(ResponseCode::DataBlock, 0, 1, 0, 0, vec![0xAB; 40]).to_bytes();
        let mut buffer = FrameBuffer::new();

        assert_eq!(buffer.push(&raw[..4]).unwrap(), Assembly::Incomplete);
        assert!(buffer.started_at().is_some());
        assert_eq!(buffer.push(&raw[4..20]).unwrap(), Assembly::Incomplete);
        assert_eq!(buffer.push(&raw[20..]).unwrap(), Assembly::Complete(raw.clone()));
        assert!(buffer.is_empty());
        assert!(buffer.started_at().is_none());
    }

    #[test]
    fn test_buffer_rejects_overflow() {
        let mut raw = Frame::response(ResponseCode::DataBlock, 0, 1, 0, 0, vec![0; 4])
            .to_bytes()
            .to_vec();
        raw.push(0x00);

        let mut buffer = FrameBuffer::new();
        assert_eq!(
            buffer.push(&raw),
            Err(Error::LengthMismatch {
                declared: 4,
                received: 5
            })
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_rejects_oversized() {
        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            buffer.push(&hex!("80FFFFFF000000000000")),
            Err(Error::Oversized(_))
        ));
    }
}
