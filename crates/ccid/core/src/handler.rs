//! CCID command/response correlation
//!
//! [`CcidHandler`] owns the sequence counter and the single outstanding command,
//! and wraps frames in the secure channel once session keys are installed.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::device::Reader;
use crate::error::{Error, Result};
use crate::frame::{self, CommandCode, Response};
use crate::secure_channel::SessionKeys;
use crate::status::{HeaderStatus, LOW_POWER_FLAG, SlotError, SlotState};

/// Last command handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    /// Command code sent
    pub code: CommandCode,
    /// Sequence number of the command
    pub sequence: u8,
    /// Target slot
    pub slot: u8,
    /// Still waiting for the reader's answer
    pub awaiting_response: bool,
}

/// Outcome of a status notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Reader reports low-power mode
    pub low_power: bool,
    /// Slots that went through a removal or an insertion
    pub changes: Vec<(u8, SlotState)>,
}

/// Sequencing and framing of CCID exchanges
#[derive(Debug, Default)]
pub struct CcidHandler {
    sequence: u8,
    last: Option<PendingCommand>,
    keys: Option<SessionKeys>,
}

impl CcidHandler {
    /// Create a handler with sequence number 0 and no secure channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the next command
    pub const fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Last command sent, answered or not
    pub const fn last_command(&self) -> Option<&PendingCommand> {
        self.last.as_ref()
    }

    /// Whether a command is waiting for its response
    pub fn is_pending(&self) -> bool {
        self.last.is_some_and(|cmd| cmd.awaiting_response)
    }

    /// Whether frames are protected by the secure channel
    pub const fn is_secure(&self) -> bool {
        self.keys.is_some()
    }

    /// Install session keys, every following frame is protected
    pub fn set_session_keys(&mut self, keys: SessionKeys) {
        debug!("Secure channel enabled");
        self.keys = Some(keys);
    }

    /// Drop the session keys
    pub fn clear_session_keys(&mut self) {
        self.keys = None;
    }

    /// Forget every per-connection state
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.last = None;
        self.keys = None;
    }

    /// Give up on the outstanding command
    pub fn abort(&mut self) -> Option<PendingCommand> {
        let pending = self.last.filter(|cmd| cmd.awaiting_response)?;
        self.last = None;
        self.sequence = self.sequence.wrapping_add(1);
        Some(pending)
    }

    /// Build the next command frame
    pub fn build(&mut self, code: CommandCode, slot: usize, payload: &[u8]) -> Result<Bytes> {
        let slot = u8::try_from(slot).map_err(|_| Error::InvalidSlot(slot))?;
        if self.is_pending() {
            return Err(Error::Busy);
        }

        let plain = frame::encode(code, slot, self.sequence, payload);
        trace!(
            code = %code,
            slot,
            sequence = self.sequence,
            frame = %hex::encode(&plain),
            "Building command"
        );

        let raw = match self.keys.as_mut() {
            Some(keys) => keys.encrypt_frame(&plain)?,
            None => plain,
        };

        self.last = Some(PendingCommand {
            code,
            sequence: self.sequence,
            slot,
            awaiting_response: true,
        });
        Ok(raw)
    }

    /// Check and decode the response to the outstanding command
    ///
    /// A time extension response is returned as is but leaves the command
    /// outstanding: the sequence number does not move and the final answer is
    /// still expected.
    pub fn consume(&mut self, raw: &[u8]) -> Result<Response> {
        if raw.len() < frame::HEADER_LEN {
            return Err(Error::FrameTooShort(raw.len()));
        }

        let pending = match self.last {
            Some(cmd) if cmd.awaiting_response => cmd,
            _ => return Err(Error::Unsolicited),
        };

        let response = self.open(raw);
        let extension = response.as_ref().is_ok_and(|r| {
            r.header_status().is_time_extension()
                && r.sequence() == pending.sequence
                && r.slot() == pending.slot
        });
        if extension {
            debug!(sequence = pending.sequence, "Reader requested a time extension");
            return response;
        }

        if let Some(cmd) = self.last.as_mut() {
            cmd.awaiting_response = false;
        }
        self.sequence = self.sequence.wrapping_add(1);

        let response = response?;
        if !response.is_complete() {
            return Err(Error::LengthMismatch {
                declared: response.declared_length(),
                received: response.payload().len(),
            });
        }
        if response.sequence() != pending.sequence {
            return Err(Error::SequenceMismatch {
                expected: pending.sequence,
                received: response.sequence(),
            });
        }
        if response.slot() != pending.slot {
            return Err(Error::SlotMismatch {
                expected: pending.slot,
                received: response.slot(),
            });
        }
        if response.code() != pending.code.expected_response() as u8 {
            return Err(Error::UnexpectedResponse {
                response: response.code(),
                command: pending.code as u8,
            });
        }

        Ok(response)
    }

    fn open(&mut self, raw: &[u8]) -> Result<Response> {
        let plain = match self.keys.as_mut() {
            Some(keys) => keys.decrypt_frame(raw)?,
            None => Bytes::copy_from_slice(raw),
        };
        trace!(frame = %hex::encode(&plain), "Consuming response");
        Ok(Response::new(frame::decode(&plain)?))
    }

    /// Apply a status notification to the readers
    pub fn interpret_status(&self, data: &[u8], readers: &mut [Reader]) -> Result<StatusUpdate> {
        let (&head, bitmap) = data
            .split_first()
            .ok_or(Error::protocol("Empty status notification"))?;

        let reported = (head & !LOW_POWER_FLAG) as usize;
        if reported != readers.len() {
            return Err(Error::SlotCountMismatch {
                expected: readers.len(),
                reported,
            });
        }
        if bitmap.len() < readers.len().div_ceil(4) {
            return Err(Error::protocol("Truncated status notification"));
        }

        let mut update = StatusUpdate {
            low_power: head & LOW_POWER_FLAG != 0,
            changes: Vec::new(),
        };
        for (i, reader) in readers.iter_mut().enumerate() {
            let state = SlotState::from_bits(bitmap[i / 4] >> (2 * (i % 4)));
            if reader.apply_slot_state(state) {
                debug!(slot = reader.index, %state, "Slot state changed");
                update.changes.push((reader.index, state));
            }
        }

        Ok(update)
    }

    /// Decode the `bStatus` byte of a response header
    pub const fn interpret_ccid_header_status(status: u8) -> HeaderStatus {
        HeaderStatus::from_byte(status)
    }

    /// Decode the `bError` byte of a response header, `None` when it reports no error
    pub const fn interpret_ccid_header_error(error: u8) -> Option<SlotError> {
        SlotError::from_byte(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, ResponseCode};
    use hex_literal::hex;

    fn answer(handler: &CcidHandler, code: ResponseCode, payload: &[u8]) -> Bytes {
        let pending = handler.last_command().unwrap();
        Frame::response(
            code,
            pending.slot,
            pending.sequence,
            0x00,
            0x00,
            Bytes::copy_from_slice(payload),
        )
        .to_bytes()
    }

    #[test]
    fn test_build_rejects_invalid_slot() {
        let mut handler = CcidHandler::new();
        assert_eq!(
            handler.build(CommandCode::XfrBlock, 300, &[]),
            Err(Error::InvalidSlot(300))
        );
        assert!(!handler.is_pending());
        assert!(handler.build(CommandCode::XfrBlock, 255, &[]).is_ok());
    }

    #[test]
    fn test_single_outstanding_command() {
        let mut handler = CcidHandler::new();
        handler.build(CommandCode::GetSlotStatus, 0, &[]).unwrap();
        assert_eq!(
            handler.build(CommandCode::GetSlotStatus, 0, &[]),
            Err(Error::Busy)
        );

        let raw = answer(&handler, ResponseCode::SlotStatus, &[]);
        handler.consume(&raw).unwrap();
        assert!(handler.build(CommandCode::GetSlotStatus, 0, &[]).is_ok());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut handler = CcidHandler::new();
        let start = handler.sequence();

        for i in 0..256u32 {
            let raw = handler.build(CommandCode::XfrBlock, 0, &hex!("0084000008")).unwrap();
            assert_eq!(raw[6] as u32, (start as u32 + i) % 256);
            let response = answer(&handler, ResponseCode::DataBlock, &hex!("9000"));
            handler.consume(&response).unwrap();
        }

        assert_eq!(handler.sequence(), start);
    }

    #[test]
    fn test_consume_checks_correlation() {
        let mut handler = CcidHandler::new();
        assert_eq!(handler.consume(&[0x80; 4]), Err(Error::FrameTooShort(4)));
        assert_eq!(
            handler.consume(&hex!("80000000000000000000")),
            Err(Error::Unsolicited)
        );

        handler.build(CommandCode::IccPowerOn, 1, &[]).unwrap();
        let wrong_seq = Frame::response(ResponseCode::DataBlock, 1, 7, 0, 0, Bytes::new());
        assert_eq!(
            handler.consume(&wrong_seq.to_bytes()),
            Err(Error::SequenceMismatch {
                expected: 0,
                received: 7
            })
        );

        handler.build(CommandCode::IccPowerOn, 1, &[]).unwrap();
        let raw = answer(&handler, ResponseCode::SlotStatus, &[]);
        assert_eq!(
            handler.consume(&raw),
            Err(Error::UnexpectedResponse {
                response: 0x81,
                command: 0x62
            })
        );
    }

    #[test]
    fn test_consume_rejects_other_slot() {
        let mut handler = CcidHandler::new();
        handler.build(CommandCode::IccPowerOn, 1, &[]).unwrap();
        let other = Frame::response(ResponseCode::DataBlock, 0, 0, 0, 0, hex!("3B00").to_vec());
        assert_eq!(
            handler.consume(&other.to_bytes()),
            Err(Error::SlotMismatch {
                expected: 1,
                received: 0
            })
        );
        assert!(!handler.is_pending());
    }

    #[test]
    fn test_time_extension_keeps_command_pending() {
        let mut handler = CcidHandler::new();
        handler.build(CommandCode::XfrBlock, 0, &hex!("00B0000010")).unwrap();

        let wait = Frame::response(ResponseCode::DataBlock, 0, 0, 0x80, 0x01, Bytes::new());
        let response = handler.consume(&wait.to_bytes()).unwrap();
        assert!(response.header_status().is_time_extension());
        assert!(handler.is_pending());
        assert_eq!(handler.sequence(), 0);
        assert_eq!(
            handler.build(CommandCode::XfrBlock, 0, &[]),
            Err(Error::Busy)
        );

        let raw = answer(&handler, ResponseCode::DataBlock, &hex!("12349000"));
        let response = handler.consume(&raw).unwrap();
        assert_eq!(response.payload().as_ref(), hex!("12349000"));
        assert!(!handler.is_pending());
        assert_eq!(handler.sequence(), 1);
    }

    #[test]
    fn test_abort_frees_the_slot() {
        let mut handler = CcidHandler::new();
        assert!(handler.abort().is_none());
        handler.build(CommandCode::Escape, 0, &hex!("5820")).unwrap();
        assert_eq!(handler.abort().unwrap().code, CommandCode::Escape);
        assert_eq!(handler.sequence(), 1);
        assert!(handler.build(CommandCode::Escape, 0, &hex!("5820")).is_ok());
    }

    #[test]
    fn test_secure_exchange() {
        let keys = SessionKeys::from_raw([0x11; 16], [0x22; 16], [0x33; 16]);
        let mut reader_keys = keys.clone();

        let mut handler = CcidHandler::new();
        handler.set_session_keys(keys);
        assert!(handler.is_secure());

        let raw = handler.build(CommandCode::XfrBlock, 0, &hex!("00B0000010")).unwrap();
        assert!(frame::is_ciphered(&raw));
        let command = frame::decode(&reader_keys.decrypt_frame(&raw).unwrap()).unwrap();
        assert_eq!(command.payload().as_ref(), hex!("00B0000010"));

        let plain = Frame::response(ResponseCode::DataBlock, 0, 0, 0, 0, hex!("0102039000").to_vec());
        let ciphered = reader_keys.encrypt_frame(&plain.to_bytes()).unwrap();
        let response = handler.consume(&ciphered).unwrap();
        assert_eq!(response.payload().as_ref(), hex!("0102039000"));
    }

    #[test]
    fn test_interpret_status() {
        let handler = CcidHandler::new();
        let mut readers = vec![Reader::new(0), Reader::new(1)];
        readers[0].card_connected(Bytes::from_static(&hex!("3B00")));

        let update = handler
            .interpret_status(&[0x02, 0b0000_0110], &mut readers)
            .unwrap();
        assert!(!update.low_power);
        assert_eq!(update.changes, vec![(0, SlotState::Removed)]);
        assert_eq!(readers[0].slot_state, SlotState::Removed);
        assert!(!readers[0].card_powered);
        assert_eq!(readers[1].slot_state, SlotState::Present);
        assert!(readers[1].card_present);
    }

    #[test]
    fn test_interpret_status_errors() {
        let handler = CcidHandler::new();
        let mut readers = vec![Reader::new(0), Reader::new(1)];

        assert_eq!(
            handler.interpret_status(&[0x03, 0x00], &mut readers),
            Err(Error::SlotCountMismatch {
                expected: 2,
                reported: 3
            })
        );
        assert!(handler.interpret_status(&[0x02], &mut readers).is_err());
        assert!(handler.interpret_status(&[], &mut readers).is_err());

        let update = handler
            .interpret_status(&[0x82, 0b0000_1100], &mut readers)
            .unwrap();
        assert!(update.low_power);
        assert_eq!(update.changes, vec![(1, SlotState::Inserted)]);
    }

    #[test]
    fn test_header_interpretation() {
        let status = CcidHandler::interpret_ccid_header_status(0x41);
        assert!(status.is_failed());
        assert!(!status.icc.is_powered());
        assert_eq!(CcidHandler::interpret_ccid_header_error(0x00), None);
        assert_eq!(
            CcidHandler::interpret_ccid_header_error(0xFB),
            Some(SlotError::HwError)
        );
    }
}
