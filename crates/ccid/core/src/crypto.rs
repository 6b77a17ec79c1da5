//! AES-128 primitives for the secure channel
//!
//! ECB is used for the key schedule and the handshake, CBC for payloads and a
//! chained-ECB MAC for integrity. Payload and MAC inputs are padded with `0x80`
//! followed by zero bytes up to the next block boundary (ISO/IEC 7816-4).

use aes::Aes128;
use cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    block_padding::Iso7816, generic_array::GenericArray,
};

use crate::error::{Error, Result};

/// AES block size in bytes
pub const BLOCK_LEN: usize = 16;

/// One AES block, also used for keys and IVs
pub type Block = [u8; BLOCK_LEN];

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// Encrypt a single block in ECB mode
pub(crate) fn ecb_encrypt(key: &Block, block: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    to_block(&buf)
}

/// Decrypt a single block in ECB mode
pub(crate) fn ecb_decrypt(key: &Block, block: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut buf);
    to_block(&buf)
}

/// Pad and encrypt data in CBC mode
pub(crate) fn cbc_encrypt(key: &Block, iv: &Block, data: &[u8]) -> Vec<u8> {
    Encryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .encrypt_padded_vec_mut::<Iso7816>(data)
}

/// Decrypt data in CBC mode and strip the padding
pub(crate) fn cbc_decrypt(key: &Block, iv: &Block, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(Error::protocol("Ciphertext is not a whole number of blocks"));
    }

    Decryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .decrypt_padded_vec_mut::<Iso7816>(data)
        .map_err(|_| Error::Padding)
}

/// Chained-ECB MAC: every padded block is XORed with the running value and then
/// encrypted, starting from `iv`. The final running value is the MAC.
pub(crate) fn cmac(key: &Block, iv: &Block, data: &[u8]) -> Block {
    let chained = cbc_encrypt(key, iv, data);
    let mut mac = Block::default();
    mac.copy_from_slice(&chained[chained.len() - BLOCK_LEN..]);
    mac
}

/// Rotate a block one byte to the left
pub(crate) fn rotate_left(block: &Block) -> Block {
    let mut out = *block;
    out.rotate_left(1);
    out
}

/// Rotate a block one byte to the right
pub(crate) fn rotate_right(block: &Block) -> Block {
    let mut out = *block;
    out.rotate_right(1);
    out
}

/// XOR two blocks
pub(crate) fn xor(a: &Block, b: &Block) -> Block {
    let mut out = *a;
    out.iter_mut().zip(b.iter()).for_each(|(x, y)| *x ^= *y);
    out
}

fn to_block(buf: &[u8]) -> Block {
    let mut block = Block::default();
    block.copy_from_slice(buf);
    block
}
