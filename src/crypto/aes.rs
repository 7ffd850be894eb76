//! AES-128 block modes and counter arithmetic.
//!
//! ## Counter layout
//!
//! NCA body sections use AES-128-CTR with a 16-byte counter treated as four
//! big-endian `u32` limbs. Advancing the counter by `n` blocks adds `n` to
//! the last limb and carries into the limbs before it; a carry out of the
//! first limb is dropped.
//!
//! ```text
//! [0..4] limb 0 (most significant)   [4..8]   limb 1
//! [8..12] limb 2                     [12..16] limb 3 (least significant)
//! ```
//!
//! [`ctr_xor`] never mutates the caller's counter. Callers that start in the
//! middle of a region pre-advance it with [`increment_counter`].

use std::fmt;

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use byteorder::{BigEndian, ByteOrder};

use super::BLOCK_SIZE;
use crate::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A 16-byte AES-128 key.
///
/// `Debug` prints only the first two bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AesKey128(pub [u8; 16]);

impl AesKey128 {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    fn cipher(&self) -> Aes128 {
        Aes128::new(GenericArray::from_slice(&self.0))
    }
}

impl From<[u8; 16]> for AesKey128 {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for AesKey128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AesKey128({:02x}{:02x}…)", self.0[0], self.0[1])
    }
}

/// A 16-byte counter, IV or tweak value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AesIv128(pub [u8; 16]);

impl AesIv128 {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// NCA section counter: the 64-bit upper IV followed by `offset / 16`,
    /// both big-endian.
    pub fn from_upper_iv(upper: u64, offset: u64) -> Self {
        let mut iv = [0u8; 16];
        BigEndian::write_u64(&mut iv[..8], upper);
        BigEndian::write_u64(&mut iv[8..], offset >> 4);
        Self(iv)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for AesIv128 {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for AesIv128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AesIv128({})", hex::encode(self.0))
    }
}

/// Encrypt one block with AES-128-ECB.
pub fn ecb_encrypt(key: &AesKey128, block: &[u8; 16]) -> [u8; 16] {
    let mut out = *block;
    key.cipher().encrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

/// Decrypt one block with AES-128-ECB (key area and title key unwrapping).
pub fn ecb_decrypt(key: &AesKey128, block: &[u8; 16]) -> [u8; 16] {
    let mut out = *block;
    key.cipher().decrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

/// Encrypt `data` in place with AES-128-CBC.
///
/// Returns [`Error::UnalignedLength`] unless `data.len()` is a multiple of 16.
pub fn cbc_encrypt(key: &AesKey128, iv: &AesIv128, data: &mut [u8]) -> Result<()> {
    let len = check_aligned(data.len())?;
    Aes128CbcEnc::new(GenericArray::from_slice(&key.0), GenericArray::from_slice(&iv.0))
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| Error::UnalignedLength(len))?;
    Ok(())
}

/// Decrypt `data` in place with AES-128-CBC.
///
/// Returns [`Error::UnalignedLength`] unless `data.len()` is a multiple of 16.
pub fn cbc_decrypt(key: &AesKey128, iv: &AesIv128, data: &mut [u8]) -> Result<()> {
    let len = check_aligned(data.len())?;
    Aes128CbcDec::new(GenericArray::from_slice(&key.0), GenericArray::from_slice(&iv.0))
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::UnalignedLength(len))?;
    Ok(())
}

/// XOR `data` with the AES-128-CTR keystream starting at `counter`.
///
/// Works for any length; the same call encrypts and decrypts. The keystream
/// is generated one block at a time from a local copy of the counter.
pub fn ctr_xor(key: &AesKey128, counter: &AesIv128, data: &mut [u8]) {
    let cipher = key.cipher();
    let mut ctr = *counter;
    for chunk in data.chunks_mut(BLOCK_SIZE) {
        let mut pad = ctr.0;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut pad));
        for (b, p) in chunk.iter_mut().zip(pad.iter()) {
            *b ^= p;
        }
        ctr = increment_counter(&ctr, 1);
    }
}

/// Advance `counter` by `n` blocks using 32-bit big-endian limb addition.
pub fn increment_counter(counter: &AesIv128, n: u64) -> AesIv128 {
    let mut out = counter.0;
    let mut carry = n as u128;
    for limb in out.chunks_exact_mut(4).rev() {
        if carry == 0 {
            break;
        }
        let sum = BigEndian::read_u32(limb) as u128 + carry;
        BigEndian::write_u32(limb, sum as u32);
        carry = sum >> 32;
    }
    AesIv128(out)
}

fn check_aligned(len: usize) -> Result<usize> {
    if len % BLOCK_SIZE != 0 {
        return Err(Error::UnalignedLength(len));
    }
    Ok(len)
}
