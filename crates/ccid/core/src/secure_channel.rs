//! Secure channel between host and reader
//!
//! The channel is opened by a three step mutual authentication based on a
//! pre-shared AES-128 key:
//!
//! 1. host sends `00 0A 01 <key index>`
//! 2. reader answers `FF || Enc(rndB)`
//! 3. host sends `FF || Enc(rndA) || Enc(rotl(rndB))`
//! 4. reader answers `00 || Enc(rotl(rndA))`
//!
//! Both sides then derive [`SessionKeys`] from the two random numbers. Every
//! frame afterwards is CBC encrypted and carries the eight leftmost bytes of a
//! chained-ECB MAC computed over the plaintext frame. The MAC of a frame becomes
//! the IV of the next frame in the same direction.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{
    BLOCK_LEN, Block, cbc_decrypt, cbc_encrypt, cmac, ecb_decrypt, ecb_encrypt, rotate_left,
    rotate_right, xor,
};
use crate::error::{Error, Result};
use crate::frame::{HEADER_LEN, is_ciphered, set_length};

/// Opcode of a handshake message that expects a follow-up
pub const FOLLOWING: u8 = 0xFF;

/// Opcode of a successful final handshake message
pub const SUCCESS: u8 = 0x00;

/// Handshake protocol version
pub const AUTH_VERSION: u8 = 0x01;

/// Authenticate command prefix
const AUTH_COMMAND: [u8; 2] = [0x00, 0x0A];

/// Length of the MAC appended to ciphered frames
pub const MAC_LEN: usize = 8;

/// Length of a reader handshake message (opcode plus one block)
const DEVICE_MESSAGE_LEN: usize = 1 + BLOCK_LEN;

/// Session keys and IV chains of an authenticated channel
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    enc: Block,
    mac: Block,
    send_iv: Block,
    recv_iv: Block,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Derive the session keys from the pre-shared key and both random numbers
    pub fn derive(key: &Block, rnd_a: &Block, rnd_b: &Block) -> Self {
        let mut sv1 = Block::default();
        let mut sv2 = Block::default();
        for (at, from) in [(0, 0), (8, 8)] {
            sv1[at..at + 4].copy_from_slice(&rnd_a[from..from + 4]);
            sv1[at + 4..at + 8].copy_from_slice(&rnd_b[from..from + 4]);
            sv2[at..at + 4].copy_from_slice(&rnd_a[from + 4..from + 8]);
            sv2[at + 4..at + 8].copy_from_slice(&rnd_b[from + 4..from + 8]);
        }

        let enc = ecb_encrypt(key, &sv1);
        let mac = ecb_encrypt(key, &sv2);
        let iv = ecb_encrypt(&mac, &xor(rnd_a, rnd_b));

        sv1.zeroize();
        sv2.zeroize();

        Self::from_raw(enc, mac, iv)
    }

    /// Build keys from known values, both IV chains starting at `iv`
    pub const fn from_raw(enc: Block, mac: Block, iv: Block) -> Self {
        Self {
            enc,
            mac,
            send_iv: iv,
            recv_iv: iv,
        }
    }

    /// Current IV of the outgoing chain
    pub const fn send_iv(&self) -> &Block {
        &self.send_iv
    }

    /// Current IV of the incoming chain
    pub const fn recv_iv(&self) -> &Block {
        &self.recv_iv
    }

    /// Protect an outgoing plaintext frame
    pub fn encrypt_frame(&mut self, frame: &[u8]) -> Result<Bytes> {
        if frame.len() < HEADER_LEN {
            return Err(Error::FrameTooShort(frame.len()));
        }

        let mac = cmac(&self.mac, &self.send_iv, frame);
        let ciphertext = cbc_encrypt(&self.enc, &self.send_iv, &frame[HEADER_LEN..]);

        let mut out = BytesMut::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
        out.put_slice(&frame[..HEADER_LEN]);
        set_length(&mut out, ciphertext.len() + MAC_LEN, true);
        out.put_slice(&ciphertext);
        out.put_slice(&mac[..MAC_LEN]);

        self.send_iv = mac;
        Ok(out.freeze())
    }

    /// Verify and decipher an incoming frame
    pub fn decrypt_frame(&mut self, frame: &[u8]) -> Result<Bytes> {
        if frame.len() < HEADER_LEN {
            return Err(Error::FrameTooShort(frame.len()));
        }
        if !is_ciphered(frame) {
            return Err(Error::authentication("Plain frame on a secure channel"));
        }

        let body = &frame[HEADER_LEN..];
        if body.len() < BLOCK_LEN + MAC_LEN {
            return Err(Error::protocol("Ciphered frame too short"));
        }
        let (ciphertext, received_mac) = body.split_at(body.len() - MAC_LEN);

        let payload = cbc_decrypt(&self.enc, &self.recv_iv, ciphertext)?;

        let mut plain = BytesMut::with_capacity(HEADER_LEN + payload.len());
        plain.put_slice(&frame[..HEADER_LEN]);
        set_length(&mut plain, payload.len(), false);
        plain.put_slice(&payload);

        let mac = cmac(&self.mac, &self.recv_iv, &plain);
        let diff = mac[..MAC_LEN]
            .iter()
            .zip(received_mac)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(Error::Mac);
        }

        self.recv_iv = mac;
        Ok(plain.freeze())
    }
}

/// Host side of the mutual authentication
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Authenticator {
    key: Block,
    key_index: u8,
    rnd_a: Block,
    rnd_b: Option<Block>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("key_index", &self.key_index)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Start a handshake, drawing the host random number from `rng`
    pub fn new<R: RngCore + ?Sized>(key: &Block, key_index: u8, rng: &mut R) -> Self {
        let mut rnd_a = Block::default();
        rng.fill_bytes(&mut rnd_a);
        Self::with_random(key, key_index, rnd_a)
    }

    /// Start a handshake with a known host random number
    pub const fn with_random(key: &Block, key_index: u8, rnd_a: Block) -> Self {
        Self {
            key: *key,
            key_index,
            rnd_a,
            rnd_b: None,
        }
    }

    /// Key slot used on the reader
    pub const fn key_index(&self) -> u8 {
        self.key_index
    }

    /// Whether the reader challenge has been processed
    pub const fn is_challenged(&self) -> bool {
        self.rnd_b.is_some()
    }

    /// First handshake message
    pub fn host_auth_cmd(&self) -> Vec<u8> {
        let mut cmd = AUTH_COMMAND.to_vec();
        cmd.push(AUTH_VERSION);
        cmd.push(self.key_index);
        cmd
    }

    /// Process the reader challenge and build the host answer
    pub fn device_challenge(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        let block = device_block(response, FOLLOWING)?;
        let rnd_b = ecb_decrypt(&self.key, &block);
        debug!("Received reader challenge");

        let mut answer = Vec::with_capacity(1 + 2 * BLOCK_LEN);
        answer.push(FOLLOWING);
        answer.extend_from_slice(&ecb_encrypt(&self.key, &self.rnd_a));
        answer.extend_from_slice(&ecb_encrypt(&self.key, &rotate_left(&rnd_b)));

        self.rnd_b = Some(rnd_b);
        Ok(answer)
    }

    /// Verify the reader proof and derive the session keys
    pub fn device_confirmation(&mut self, response: &[u8]) -> Result<SessionKeys> {
        let rnd_b = self
            .rnd_b
            .ok_or(Error::authentication("Confirmation received before challenge"))?;

        let block = device_block(response, SUCCESS)?;
        let proof = rotate_right(&ecb_decrypt(&self.key, &block));
        if proof != self.rnd_a {
            return Err(Error::authentication("Reader proof does not match"));
        }

        debug!(key_index = self.key_index, "Mutual authentication succeeded");
        Ok(SessionKeys::derive(&self.key, &self.rnd_a, &rnd_b))
    }
}

fn device_block(response: &[u8], opcode: u8) -> Result<Block> {
    if response.len() != DEVICE_MESSAGE_LEN {
        return Err(Error::authentication("Invalid handshake message length"));
    }
    if response[0] != opcode {
        return Err(Error::authentication("Unexpected handshake opcode"));
    }

    let mut block = Block::default();
    block.copy_from_slice(&response[1..]);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CommandCode, declared_length, encode};
    use hex_literal::hex;

    const KEY: Block = hex!("E7AEAA9C5E5B0E1C3E0F8D7A29B9D5C1");
    const RND_A: Block = hex!("A0A1A2A3A4A5A6A7A8A9AAABACADAEAF");
    const RND_B: Block = hex!("B0B1B2B3B4B5B6B7B8B9BABBBCBDBEBF");

    fn reader_challenge() -> Vec<u8> {
        let mut message = vec![FOLLOWING];
        message.extend_from_slice(&ecb_encrypt(&KEY, &RND_B));
        message
    }

    fn reader_proof(rnd_a: &Block) -> Vec<u8> {
        let mut message = vec![SUCCESS];
        message.extend_from_slice(&ecb_encrypt(&KEY, &rotate_left(rnd_a)));
        message
    }

    #[test]
    fn test_host_auth_cmd() {
        let auth = Authenticator::with_random(&KEY, 2, RND_A);
        assert_eq!(auth.host_auth_cmd(), vec![0x00, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn test_handshake() {
        let mut auth = Authenticator::with_random(&KEY, 0, RND_A);

        let answer = auth.device_challenge(&reader_challenge()).unwrap();
        assert_eq!(answer.len(), 33);
        assert_eq!(answer[0], FOLLOWING);
        assert_eq!(ecb_decrypt(&KEY, answer[1..17].try_into().unwrap()), RND_A);
        assert_eq!(
            ecb_decrypt(&KEY, answer[17..].try_into().unwrap()),
            rotate_left(&RND_B)
        );

        let keys = auth.device_confirmation(&reader_proof(&RND_A)).unwrap();
        let expected = SessionKeys::derive(&KEY, &RND_A, &RND_B);
        assert_eq!(keys.enc, expected.enc);
        assert_eq!(keys.send_iv(), keys.recv_iv());
    }

    #[test]
    fn test_handshake_rejects_bad_messages() {
        let mut auth = Authenticator::with_random(&KEY, 0, RND_A);
        assert!(matches!(
            auth.device_confirmation(&reader_proof(&RND_A)),
            Err(Error::Authentication(_))
        ));

        let mut challenge = reader_challenge();
        challenge[0] = SUCCESS;
        assert!(auth.device_challenge(&challenge).is_err());
        assert!(auth.device_challenge(&challenge[..16]).is_err());

        auth.device_challenge(&reader_challenge()).unwrap();
        assert_eq!(
            auth.device_confirmation(&reader_proof(&RND_B))
                .unwrap_err()
                .kind(),
            crate::error::ErrorKind::Authentication
        );
    }

    #[test]
    fn test_key_derivation_layout() {
        let keys = SessionKeys::derive(&KEY, &RND_A, &RND_B);

        let sv1 = hex!("A0A1A2A3B0B1B2B3A8A9AAABB8B9BABB");
        let sv2 = hex!("A4A5A6A7B4B5B6B7ACADAEAFBCBDBEBF");
        assert_eq!(keys.enc, ecb_encrypt(&KEY, &sv1));
        assert_eq!(keys.mac, ecb_encrypt(&KEY, &sv2));
        assert_eq!(
            *keys.send_iv(),
            ecb_encrypt(&keys.mac, &xor(&RND_A, &RND_B))
        );
    }

    #[test]
    fn test_frame_protection_roundtrip() {
        let mut host = SessionKeys::derive(&KEY, &RND_A, &RND_B);
        let mut reader = host.clone();

        let plain = encode(CommandCode::XfrBlock, 0, 5, &hex!("00A4040007A0000000041010"));
        let ciphered = host.encrypt_frame(&plain).unwrap();

        assert!(is_ciphered(&ciphered));
        assert_eq!(declared_length(&ciphered).unwrap(), 16 + MAC_LEN);
        assert_eq!(ciphered.len(), HEADER_LEN + 16 + MAC_LEN);
        assert_eq!(&ciphered[5..HEADER_LEN], &plain[5..HEADER_LEN]);

        assert_eq!(reader.decrypt_frame(&ciphered).unwrap(), plain);
        assert_eq!(host.send_iv(), reader.recv_iv());
        assert_ne!(host.send_iv(), host.recv_iv());
    }

    #[test]
    fn test_iv_chains_across_frames() {
        let mut host = SessionKeys::derive(&KEY, &RND_A, &RND_B);
        let mut reader = host.clone();

        let first = encode(CommandCode::GetSlotStatus, 0, 0, &[]);
        let second = encode(CommandCode::GetSlotStatus, 0, 1, &[]);
        let c1 = host.encrypt_frame(&first).unwrap();
        let c2 = host.encrypt_frame(&second).unwrap();

        // Replaying out of order breaks the chain
        let mut replay = reader.clone();
        assert_eq!(replay.decrypt_frame(&c2), Err(Error::Mac));

        assert_eq!(reader.decrypt_frame(&c1).unwrap(), first);
        assert_eq!(reader.decrypt_frame(&c2).unwrap(), second);
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut host = SessionKeys::derive(&KEY, &RND_A, &RND_B);
        let mut reader = host.clone();

        let plain = encode(CommandCode::XfrBlock, 1, 9, &hex!("0084000008"));
        let mut ciphered = host.encrypt_frame(&plain).unwrap().to_vec();
        let last = ciphered.len() - 1;
        ciphered[last] ^= 0x01;
        assert_eq!(reader.decrypt_frame(&ciphered), Err(Error::Mac));

        let mut reader = host.clone();
        let plain = encode(CommandCode::XfrBlock, 1, 10, &hex!("0084000008"));
        let mut ciphered = SessionKeys::derive(&KEY, &RND_A, &RND_B)
            .encrypt_frame(&plain)
            .unwrap()
            .to_vec();
        ciphered[HEADER_LEN] ^= 0x01;
        assert!(matches!(
            reader.decrypt_frame(&ciphered),
            Err(Error::Mac | Error::Padding)
        ));
    }

    #[test]
    fn test_plain_frame_rejected() {
        let mut keys = SessionKeys::derive(&KEY, &RND_A, &RND_B);
        let plain = encode(CommandCode::XfrBlock, 0, 0, &[0u8; 24]);
        assert!(matches!(
            keys.decrypt_frame(&plain),
            Err(Error::Authentication(_))
        ));
    }
}
