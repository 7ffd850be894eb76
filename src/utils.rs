//! Low-level I/O and field-access primitives shared by all parsers.
//!
//! Each reader function reads exactly the bytes it promises or returns an
//! error - there is no partial-read ambiguity. [`Fields`] covers the
//! fixed-layout structures (NCA header, FS header) that are decrypted into
//! a buffer first and then read at known offsets.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, Result};

/// Read exactly `N` bytes into a fixed-size array.
#[inline]
pub(crate) fn bytesa<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Read exactly `len` bytes into a `Vec`.
#[inline]
pub(crate) fn bytesv<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Verify that the next `N` bytes in the stream match `expected`.
///
/// Returns [`Error::BadMagic`] on mismatch.
#[inline]
pub(crate) fn magic<R: Read, const N: usize>(r: &mut R, expected: &[u8; N]) -> Result<()> {
    let got = bytesa::<N>(r)?;
    if &got != expected {
        return Err(Error::BadMagic);
    }
    Ok(())
}

/// Extract a null-terminated UTF-8 string from a byte slice at `offset`.
///
/// Returns [`Error::InvalidRange`] if `offset` is out of bounds, or
/// [`Error::UnterminatedName`] if no null byte is found.
#[inline]
pub(crate) fn null_string(buf: &[u8], offset: usize) -> Result<String> {
    let slice = buf.get(offset..).ok_or(Error::InvalidRange)?;
    let end = slice
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::UnterminatedName)?;
    Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
}

/// Little-endian field reader over a buffer whose length was checked once.
///
/// All accessors index with offsets below the length validated in
/// [`Fields::new`].
#[derive(Clone, Copy)]
pub(crate) struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    /// Returns [`Error::InputTooSmall`] if `buf` is shorter than `needed`.
    pub(crate) fn new(buf: &'a [u8], needed: usize) -> Result<Self> {
        if buf.len() < needed {
            return Err(Error::InputTooSmall {
                needed,
                actual: buf.len(),
            });
        }
        Ok(Self { buf: &buf[..needed] })
    }

    pub(crate) fn u8(&self, off: usize) -> u8 {
        self.buf[off]
    }

    pub(crate) fn u16(&self, off: usize) -> u16 {
        LittleEndian::read_u16(&self.buf[off..off + 2])
    }

    pub(crate) fn u32(&self, off: usize) -> u32 {
        LittleEndian::read_u32(&self.buf[off..off + 4])
    }

    pub(crate) fn u64(&self, off: usize) -> u64 {
        LittleEndian::read_u64(&self.buf[off..off + 8])
    }

    pub(crate) fn array<const N: usize>(&self, off: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[off..off + N]);
        out
    }

    pub(crate) fn slice(&self, off: usize, len: usize) -> &'a [u8] {
        &self.buf[off..off + len]
    }
}
