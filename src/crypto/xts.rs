//! AES-128-XTS as used for NCA headers.
//!
//! * Key material: the 32-byte `header_key`, split into a data key
//!   (bytes 0–15) and a tweak key (bytes 16–31).
//! * Tweak: the sector index written **big-endian** into bytes 8–15 of the
//!   tweak block, then encrypted with the tweak key. Standard IEEE 1619 uses
//!   little-endian here.
//! * Within a sector the tweak is doubled in GF(2^128) once per 16-byte
//!   block.
//!
//! Sectors whose length is not a multiple of 16 would need ciphertext
//! stealing. That is not implemented; such input is rejected with
//! [`Error::UnalignedLength`].

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use byteorder::{BigEndian, ByteOrder};

use super::{AesKey128, BLOCK_SIZE};
use crate::{Error, Result};

/// Multiply `tweak` by x in GF(2^128) (x^128 + x^7 + x^2 + x + 1).
///
/// Byte 0 is the least significant; the bit shifted out of byte 15 folds
/// back into byte 0 as `0x87`.
pub fn xts_tweak_double(tweak: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut carry = 0u8;
    for (o, &b) in out.iter_mut().zip(tweak.iter()) {
        *o = (b << 1) | carry;
        carry = b >> 7;
    }
    if carry != 0 {
        out[0] ^= 0x87;
    }
    out
}

/// Apply [`xts_tweak_double`] `n` times.
pub fn advance_tweak(tweak: &[u8; 16], n: u64) -> [u8; 16] {
    let mut t = *tweak;
    for _ in 0..n {
        t = xts_tweak_double(&t);
    }
    t
}

/// Pair of AES-128 keys for XTS.
#[derive(Clone)]
pub struct XtsCipher {
    data: Aes128,
    tweak: Aes128,
}

impl XtsCipher {
    /// Split a combined 32-byte key (data key first, tweak key second).
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            data: Aes128::new(GenericArray::from_slice(&key[..16])),
            tweak: Aes128::new(GenericArray::from_slice(&key[16..])),
        }
    }

    /// Build from separate data and tweak keys.
    pub fn from_halves(data: &AesKey128, tweak: &AesKey128) -> Self {
        Self {
            data: Aes128::new(GenericArray::from_slice(data.as_bytes())),
            tweak: Aes128::new(GenericArray::from_slice(tweak.as_bytes())),
        }
    }

    /// Encrypted initial tweak for `sector`.
    pub fn make_tweak(&self, sector: u64) -> [u8; 16] {
        let mut t = [0u8; 16];
        BigEndian::write_u64(&mut t[8..], sector);
        self.tweak.encrypt_block(GenericArray::from_mut_slice(&mut t));
        t
    }

    /// Decrypt one sector in place, starting from an already derived tweak.
    pub fn decrypt_sector(&self, sector: &mut [u8], tweak: [u8; 16]) -> Result<()> {
        self.process_sector(sector, tweak, |c, b| c.decrypt_block(b))
    }

    /// Encrypt one sector in place, starting from an already derived tweak.
    pub fn encrypt_sector(&self, sector: &mut [u8], tweak: [u8; 16]) -> Result<()> {
        self.process_sector(sector, tweak, |c, b| c.encrypt_block(b))
    }

    /// Decrypt consecutive sectors of `sector_size` bytes, the first one
    /// using the tweak of `first_sector`. A short final sector is allowed as
    /// long as it is block aligned.
    pub fn decrypt(&self, data: &mut [u8], first_sector: u64, sector_size: usize) -> Result<()> {
        check_geometry(data.len(), sector_size)?;
        for (i, sector) in data.chunks_mut(sector_size).enumerate() {
            self.decrypt_sector(sector, self.make_tweak(first_sector + i as u64))?;
        }
        Ok(())
    }

    /// Encrypt consecutive sectors; inverse of [`XtsCipher::decrypt`].
    pub fn encrypt(&self, data: &mut [u8], first_sector: u64, sector_size: usize) -> Result<()> {
        check_geometry(data.len(), sector_size)?;
        for (i, sector) in data.chunks_mut(sector_size).enumerate() {
            self.encrypt_sector(sector, self.make_tweak(first_sector + i as u64))?;
        }
        Ok(())
    }

    fn process_sector(
        &self,
        sector: &mut [u8],
        mut tweak: [u8; 16],
        op: impl Fn(&Aes128, &mut GenericArray<u8, aes::cipher::consts::U16>),
    ) -> Result<()> {
        if sector.len() % BLOCK_SIZE != 0 {
            return Err(Error::UnalignedLength(sector.len()));
        }
        for block in sector.chunks_exact_mut(BLOCK_SIZE) {
            xor_in_place(block, &tweak);
            op(&self.data, GenericArray::from_mut_slice(block));
            xor_in_place(block, &tweak);
            tweak = xts_tweak_double(&tweak);
        }
        Ok(())
    }
}

fn check_geometry(len: usize, sector_size: usize) -> Result<()> {
    if sector_size == 0 || sector_size % BLOCK_SIZE != 0 {
        return Err(Error::UnalignedLength(sector_size));
    }
    if len % BLOCK_SIZE != 0 {
        return Err(Error::UnalignedLength(len));
    }
    Ok(())
}

#[inline]
fn xor_in_place(block: &mut [u8], tweak: &[u8; 16]) {
    for (b, t) in block.iter_mut().zip(tweak.iter()) {
        *b ^= t;
    }
}
