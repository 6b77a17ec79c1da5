//! Shared fixtures: a simulated SpringCard reader and a recording transport
#![allow(dead_code)]

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use rand::RngCore;
use springcard_ccid::{
    Block, Bytes, CcidServiceKind, DeviceInfo, Discovery, Session, SessionConfig, SessionEvent,
    Transport, TransportError, TransportEvent, TransportSink,
    event::channel::{SessionEventReceiver, forward_to, session_event_channel},
    frame::{self, Assembly, CommandCode, Frame, FrameBuffer, ResponseCode},
    secure_channel::{FOLLOWING, SUCCESS, SessionKeys},
};

pub const TEST_KEY: Block = [
    0xE7, 0xAE, 0xAA, 0x9C, 0x5E, 0x5B, 0x0E, 0x1C, 0x3E, 0x0F, 0x8D, 0x7A, 0x29, 0xB9, 0xD5, 0xC1,
];

pub const RND_B: Block = [
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF,
];

pub const ATR: &[u8] = &[
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x01, 0x00,
    0x00, 0x00, 0x00, 0x6A,
];

pub const FIRMWARE: &str = "02.14-03-g1a2b3";

pub fn ecb_encrypt(key: &Block, block: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    to_block(&buf)
}

pub fn ecb_decrypt(key: &Block, block: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut buf);
    to_block(&buf)
}

fn rotate_left(block: &Block) -> Block {
    let mut out = *block;
    out.rotate_left(1);
    out
}

fn to_block(data: &[u8]) -> Block {
    data.try_into().expect("16 byte block")
}

/// Random source yielding 0xA0, 0xA1, ... so the host random number is A0..AF
#[derive(Debug, Clone)]
pub struct CountingRng(pub u8);

impl Default for CountingRng {
    fn default() -> Self {
        Self(0xA0)
    }
}

impl RngCore for CountingRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            *byte = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }
}

/// One slot of the simulated reader
#[derive(Debug, Clone, Default)]
pub struct SimSlot {
    pub present: bool,
    pub powered: bool,
    pub mute: bool,
    pub atr: Vec<u8>,
    pub name: String,
}

impl SimSlot {
    fn icc_status(&self) -> u8 {
        match (self.present, self.powered) {
            (true, true) => 0x00,
            (true, false) => 0x01,
            (false, _) => 0x02,
        }
    }
}

/// Device side of the CCID protocol, secure channel included
#[derive(Debug)]
pub struct SimulatedReader {
    pub slots: Vec<SimSlot>,
    pub key: Option<Block>,
    pub low_power: bool,
    pub tamper_responses: bool,
    pub power_on_count: Vec<usize>,
    pub commands: Vec<Frame>,
    keys: Option<SessionKeys>,
}

impl SimulatedReader {
    pub fn new(slot_count: usize) -> Self {
        let slots = (0..slot_count)
            .map(|i| SimSlot {
                name: format!("SpringCard Slot {i}"),
                ..SimSlot::default()
            })
            .collect();
        Self {
            slots,
            key: None,
            low_power: false,
            tamper_responses: false,
            power_on_count: vec![0; slot_count],
            commands: Vec::new(),
            keys: None,
        }
    }

    /// Put an unpowered card in a slot
    pub fn with_card(mut self, slot: usize) -> Self {
        self.slots[slot].present = true;
        self.slots[slot].atr = ATR.to_vec();
        self
    }

    pub fn with_key(mut self, key: Block) -> Self {
        self.key = Some(key);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.keys.is_some()
    }

    /// Status notification bytes, `Present`/`Absent` for every slot
    pub fn status_bytes(&self) -> Bytes {
        let mut data = vec![self.slots.len() as u8 | if self.low_power { 0x80 } else { 0 }];
        data.resize(1 + self.slots.len().div_ceil(4), 0);
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.present {
                data[1 + i / 4] |= 0x01 << (2 * (i % 4));
            }
        }
        Bytes::from(data)
    }

    pub fn discovery(&self, with_status: bool) -> Discovery {
        Discovery {
            info: DeviceInfo {
                vendor_name: "SpringCard".into(),
                product_name: "Puck One".into(),
                serial_number: "9A0B1C2D".into(),
                hardware_revision: None,
            },
            service: CcidServiceKind::Plain,
            slot_count: self.slots.len() as u8,
            status: with_status.then(|| self.status_bytes()),
        }
    }

    /// Answer one complete command frame
    pub fn process(&mut self, raw: &[u8]) -> Bytes {
        let plain = match self.keys.as_mut() {
            Some(keys) => keys.decrypt_frame(raw).expect("host frame protection"),
            None => Bytes::copy_from_slice(raw),
        };
        let command = frame::decode(&plain).expect("host frame");
        self.commands.push(command.clone());

        let slot = command.slot() as usize;
        let payload = command.payload().clone();
        let mut next_keys = None;

        let (code, status, error, data) = match CommandCode::try_from(command.code())
            .expect("command code")
        {
            CommandCode::Escape => {
                let (status, data) = self.escape(&payload, &mut next_keys);
                (ResponseCode::Escape, status, 0x00, data)
            }
            CommandCode::GetSlotStatus => {
                (ResponseCode::SlotStatus, self.slots[slot].icc_status(), 0x00, Vec::new())
            }
            CommandCode::IccPowerOn => {
                let sim = &mut self.slots[slot];
                if !sim.present {
                    (ResponseCode::DataBlock, 0x42, 0xFE, Vec::new())
                } else if sim.mute {
                    (ResponseCode::DataBlock, 0x41, 0xFE, Vec::new())
                } else {
                    sim.powered = true;
                    self.power_on_count[slot] += 1;
                    (ResponseCode::DataBlock, 0x00, 0x00, sim.atr.clone())
                }
            }
            CommandCode::IccPowerOff => {
                let sim = &mut self.slots[slot];
                sim.powered = false;
                (ResponseCode::SlotStatus, sim.icc_status(), 0x00, Vec::new())
            }
            CommandCode::XfrBlock => {
                let sim = &self.slots[slot];
                if !sim.present {
                    (ResponseCode::DataBlock, 0x42, 0xFE, Vec::new())
                } else if !sim.powered || sim.mute {
                    (ResponseCode::DataBlock, 0x41, 0xFE, Vec::new())
                } else {
                    let mut data = payload.to_vec();
                    data.extend_from_slice(&[0x90, 0x00]);
                    (ResponseCode::DataBlock, 0x00, 0x00, data)
                }
            }
        };

        let response = Frame::response(code, command.slot(), command.sequence(), status, error, data)
            .to_bytes();
        let mut out = match self.keys.as_mut() {
            Some(keys) => keys.encrypt_frame(&response).expect("reader frame protection").to_vec(),
            None => response.to_vec(),
        };
        if let Some(keys) = next_keys {
            self.keys = Some(keys);
        }
        if self.tamper_responses {
            let last = out.len() - 1;
            out[last] ^= 0x01;
        }
        Bytes::from(out)
    }

    fn escape(&mut self, payload: &[u8], next_keys: &mut Option<SessionKeys>) -> (u8, Vec<u8>) {
        const REJECTED: (u8, Vec<u8>) = (0x40, Vec::new());

        match payload {
            [0x00, 0x0A, 0x01, _] => match self.key {
                Some(key) => {
                    let mut data = vec![FOLLOWING];
                    data.extend_from_slice(&ecb_encrypt(&key, &RND_B));
                    (0x00, data)
                }
                None => REJECTED,
            },
            [FOLLOWING, rest @ ..] if rest.len() == 32 => {
                let Some(key) = self.key else {
                    return REJECTED;
                };
                let rnd_a = ecb_decrypt(&key, &to_block(&rest[..16]));
                if ecb_decrypt(&key, &to_block(&rest[16..])) != rotate_left(&RND_B) {
                    return REJECTED;
                }
                *next_keys = Some(SessionKeys::derive(&key, &rnd_a, &RND_B));
                let mut data = vec![SUCCESS];
                data.extend_from_slice(&ecb_encrypt(&key, &rotate_left(&rnd_a)));
                (0x00, data)
            }
            [0x58, 0x20, 0x06] => {
                let mut data = vec![0x00];
                data.extend_from_slice(FIRMWARE.as_bytes());
                (0x00, data)
            }
            [0x58, 0x21, slot] => {
                let mut data = vec![0x00];
                if let Some(sim) = self.slots.get(*slot as usize) {
                    data.extend_from_slice(sim.name.as_bytes());
                }
                (0x00, data)
            }
            [0x58, 0xBC] => {
                self.low_power = false;
                (0x00, vec![0x00, 0x01, 0x64])
            }
            [0x58, 0xAF] => (0x00, vec![0x00]),
            _ => (0x00, vec![0x01]),
        }
    }
}

/// Transport recording every write
#[derive(Debug, Default)]
pub struct MockTransport {
    pub writes: Vec<Bytes>,
    pub connected: bool,
    pub disconnect_requests: usize,
    pub closed: bool,
    pub max_write: Option<usize>,
    pub fail_writes: bool,
}

impl MockTransport {
    pub fn take_writes(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.writes)
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _sink: TransportSink) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnect_requests += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
        self.closed = true;
    }

    fn do_write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes {
            return Err(TransportError::WriteFailed("mock".into()));
        }
        self.writes.push(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn max_write_len(&self) -> Option<usize> {
        self.max_write
    }
}

/// A session wired to a simulated reader
pub struct Harness {
    pub session: Session<MockTransport>,
    pub reader: SimulatedReader,
    pub events: SessionEventReceiver,
    pub frames_written: Vec<Bytes>,
    buffer: FrameBuffer,
}

impl Harness {
    pub fn new(reader: SimulatedReader, config: SessionConfig) -> Self {
        Self::with_transport(reader, config, MockTransport::default())
    }

    pub fn with_transport(
        reader: SimulatedReader,
        config: SessionConfig,
        transport: MockTransport,
    ) -> Self {
        let (tx, events) = session_event_channel();
        let session = Session::new(transport, config, forward_to(tx)).with_rng(CountingRng::default());
        Self {
            session,
            reader,
            events,
            frames_written: Vec::new(),
            buffer: FrameBuffer::new(),
        }
    }

    /// Connect and let creation run to completion
    pub fn connect(&mut self, with_status: bool) {
        self.session
            .connect(TransportSink::discard())
            .expect("session closed");
        let discovery = self.reader.discovery(with_status);
        self.session
            .handle_transport_event(TransportEvent::Connected(discovery));
        self.pump();
    }

    /// Answer every command written so far, delivering responses in two chunks
    pub fn pump(&mut self) {
        loop {
            let writes = self.session.transport_mut().take_writes();
            if writes.is_empty() {
                return;
            }
            for chunk in writes {
                if let Assembly::Complete(raw) = self.buffer.push(&chunk).expect("host frame") {
                    self.frames_written.push(raw.clone());
                    let response = self.reader.process(&raw);
                    self.deliver(&response);
                }
            }
        }
    }

    /// Feed raw bytes to the session as two notifications
    pub fn deliver(&mut self, data: &[u8]) {
        let (head, tail) = data.split_at(data.len().min(6));
        self.session
            .handle_transport_event(TransportEvent::DataReceived(Bytes::copy_from_slice(head)));
        if !tail.is_empty() {
            self.session
                .handle_transport_event(TransportEvent::DataReceived(Bytes::copy_from_slice(tail)));
        }
    }

    /// Send a status notification and answer whatever it triggers
    pub fn notify(&mut self, status: &[u8]) {
        self.session
            .handle_transport_event(TransportEvent::StatusNotification(Bytes::copy_from_slice(
                status,
            )));
        self.pump();
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }
}
