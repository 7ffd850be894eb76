//! AES-CTR over a set of keyed byte regions.
//!
//! A [`KeyedRegionStream`] wraps the raw container and registers one
//! [`CryptoRegion`] per encrypted range. Reads and writes XOR the caller's
//! bytes with a pad built for exactly that range:
//!
//! * inside a keyed region: the CTR keystream, counter derived from the
//!   region's initial counter and the 16-byte block offset into the region;
//! * inside a plaintext region or a gap between regions: zeros.
//!
//! I/O is processed in windows of [`WINDOW_SIZE`] bytes. A window may cross
//! any number of region boundaries and gaps; the pad is assembled piece by
//! piece. No counter state is kept between calls, so arbitrary seeks are
//! always correct.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::trace;

use super::resolve_seek;
use crate::crypto::aes::{ctr_xor, increment_counter};
use crate::crypto::{AesIv128, AesKey128, BLOCK_SIZE};
use crate::{Error, Result};

/// Size of one pad generation window.
pub const WINDOW_SIZE: usize = 0x10000;

/// An encrypted (or explicitly plaintext) range `[start, end)` of the
/// underlying stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoRegion {
    pub start: u64,
    pub end: u64,
    pub is_plaintext: bool,
    pub key: AesKey128,
    /// Counter for the block at `start`.
    pub initial_counter: AesIv128,
}

impl CryptoRegion {
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end && self.start < end
    }

    /// Counter for the 16-byte block containing `offset`.
    pub fn counter_at(&self, offset: u64) -> AesIv128 {
        increment_counter(&self.initial_counter, (offset - self.start) / BLOCK_SIZE as u64)
    }

    fn keystream(&self, offset: u64, out: &mut [u8]) {
        out.fill(0);
        if self.is_plaintext {
            return;
        }
        let ctr = self.counter_at(offset);
        let skip = ((offset - self.start) % BLOCK_SIZE as u64) as usize;
        if skip == 0 {
            ctr_xor(&self.key, &ctr, out);
            return;
        }
        // Leading partial block.
        let mut first = [0u8; BLOCK_SIZE];
        ctr_xor(&self.key, &ctr, &mut first);
        let head = (BLOCK_SIZE - skip).min(out.len());
        out[..head].copy_from_slice(&first[skip..skip + head]);
        if out.len() > head {
            ctr_xor(&self.key, &increment_counter(&ctr, 1), &mut out[head..]);
        }
    }
}

/// Seekable stream that transparently applies AES-CTR per region.
pub struct KeyedRegionStream<S> {
    inner: S,
    regions: Vec<CryptoRegion>,
    pos: u64,
    len: u64,
    pad: Vec<u8>,
    scratch: Vec<u8>,
}

impl<S: Seek> KeyedRegionStream<S> {
    /// Wrap `inner`. With no regions registered the stream is a passthrough.
    pub fn new(mut inner: S) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            regions: Vec::new(),
            pos: 0,
            len,
            pad: vec![0u8; WINDOW_SIZE],
            scratch: vec![0u8; WINDOW_SIZE],
        })
    }

    /// Register `[start, end)` as encrypted with `key`; `counter` is the
    /// counter of the block at `start`.
    pub fn add_region(
        &mut self,
        start: u64,
        end: u64,
        key: AesKey128,
        counter: AesIv128,
    ) -> Result<()> {
        self.insert(CryptoRegion {
            start,
            end,
            is_plaintext: false,
            key,
            initial_counter: counter,
        })
    }

    /// Register `[start, end)` as stored in the clear.
    pub fn add_plaintext_region(&mut self, start: u64, end: u64) -> Result<()> {
        self.insert(CryptoRegion {
            start,
            end,
            is_plaintext: true,
            key: AesKey128::default(),
            initial_counter: AesIv128::default(),
        })
    }

    fn insert(&mut self, region: CryptoRegion) -> Result<()> {
        let illegal = region.start >= region.end
            || self
                .regions
                .iter()
                .any(|r| r.overlaps(region.start, region.end));
        if illegal {
            return Err(Error::IllegalRegion {
                start: region.start,
                end: region.end,
            });
        }
        trace!(
            "crypto region {:#x}..{:#x} plaintext={}",
            region.start, region.end, region.is_plaintext
        );
        self.regions.push(region);
        Ok(())
    }

    pub fn regions(&self) -> &[CryptoRegion] {
        &self.regions
    }

    /// Length of the underlying stream.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Fill `pad` with the XOR pad for `[offset, offset + pad.len())`.
fn generate_pad(regions: &[CryptoRegion], offset: u64, pad: &mut [u8]) {
    let mut done = 0usize;
    while done < pad.len() {
        let cur = offset + done as u64;
        let remaining = (pad.len() - done) as u64;
        let n = match regions.iter().find(|r| r.contains(cur)) {
            Some(region) => {
                let n = remaining.min(region.end - cur) as usize;
                region.keystream(cur, &mut pad[done..done + n]);
                n
            }
            None => {
                let gap_end = regions
                    .iter()
                    .map(|r| r.start)
                    .filter(|&s| s > cur)
                    .min()
                    .unwrap_or(u64::MAX);
                let n = remaining.min(gap_end - cur) as usize;
                pad[done..done + n].fill(0);
                n
            }
        };
        done += n;
    }
}

fn xor_windowed(regions: &[CryptoRegion], pad: &mut [u8], offset: u64, data: &mut [u8]) {
    let mut off = offset;
    for chunk in data.chunks_mut(WINDOW_SIZE) {
        let pad = &mut pad[..chunk.len()];
        generate_pad(regions, off, pad);
        for (b, p) in chunk.iter_mut().zip(pad.iter()) {
            *b ^= p;
        }
        off += chunk.len() as u64;
    }
}

impl<S: Read + Seek> Read for KeyedRegionStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(WINDOW_SIZE);
        self.inner.seek(SeekFrom::Start(self.pos))?;
        let n = self.inner.read(&mut buf[..len])?;
        xor_windowed(&self.regions, &mut self.pad, self.pos, &mut buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: Write + Seek> Write for KeyedRegionStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(WINDOW_SIZE);
        let scratch = &mut self.scratch[..len];
        scratch.copy_from_slice(&buf[..len]);
        xor_windowed(&self.regions, &mut self.pad, self.pos, scratch);
        self.inner.seek(SeekFrom::Start(self.pos))?;
        self.inner.write_all(scratch)?;
        self.pos += len as u64;
        self.len = self.len.max(self.pos);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Seek> Seek for KeyedRegionStream<S> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.len, from)?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY_A: AesKey128 = AesKey128::new([0xA0; 16]);
    const KEY_B: AesKey128 = AesKey128::new([0xB0; 16]);

    fn plain(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Plaintext layout: [0, 0x18000) key A, [0x18000, 0x20000) gap,
    /// [0x20000, 0x30010) key B.
    fn fixture() -> (Vec<u8>, KeyedRegionStream<Cursor<Vec<u8>>>) {
        let clear = plain(0x30010);
        let mut enc = clear.clone();
        let ctr_a = AesIv128::from_upper_iv(1, 0);
        let ctr_b = AesIv128::from_upper_iv(2, 0x20000);
        ctr_xor(&KEY_A, &ctr_a, &mut enc[..0x18000]);
        ctr_xor(&KEY_B, &ctr_b, &mut enc[0x20000..]);

        let mut stream = KeyedRegionStream::new(Cursor::new(enc)).unwrap();
        stream.add_region(0x20000, 0x30010, KEY_B, ctr_b).unwrap();
        stream.add_region(0, 0x18000, KEY_A, ctr_a).unwrap();
        (clear, stream)
    }

    fn read_at(stream: &mut KeyedRegionStream<Cursor<Vec<u8>>>, off: u64, len: usize) -> Vec<u8> {
        stream.seek(SeekFrom::Start(off)).unwrap();
        let mut out = vec![0u8; len];
        stream.read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn full_read_decrypts_every_region() {
        let (clear, mut stream) = fixture();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, clear);
    }

    #[test]
    fn straddling_read_equals_concatenated_reads() {
        let (clear, mut stream) = fixture();
        let whole = read_at(&mut stream, 0x17ff3, 0x8020);
        let mut pieces = read_at(&mut stream, 0x17ff3, 0xd);
        pieces.extend(read_at(&mut stream, 0x18000, 0x8000));
        pieces.extend(read_at(&mut stream, 0x20000, 0x13));
        assert_eq!(whole, pieces);
        assert_eq!(&whole[..], &clear[0x17ff3..0x17ff3 + 0x8020]);
    }

    #[test]
    fn gaps_pass_through() {
        let (clear, mut stream) = fixture();
        let out = read_at(&mut stream, 0x1a000, 0x100);
        assert_eq!(&out[..], &clear[0x1a000..0x1a100]);
    }

    #[test]
    fn unaligned_offsets_inside_a_region() {
        let (clear, mut stream) = fixture();
        for off in [1u64, 0xf, 0x11, 0x2001f] {
            let out = read_at(&mut stream, off, 0x25);
            assert_eq!(&out[..], &clear[off as usize..off as usize + 0x25]);
        }
    }

    #[test]
    fn plaintext_regions_yield_zero_pad() {
        let clear = plain(0x100);
        let mut stream = KeyedRegionStream::new(Cursor::new(clear.clone())).unwrap();
        stream.add_plaintext_region(0, 0x100).unwrap();
        let out = read_at(&mut stream, 0x10, 0x40);
        assert_eq!(&out[..], &clear[0x10..0x50]);
    }

    #[test]
    fn illegal_regions_are_rejected() {
        let mut stream = KeyedRegionStream::new(Cursor::new(vec![0u8; 0x100])).unwrap();
        stream.add_region(0x10, 0x80, KEY_A, AesIv128::default()).unwrap();
        for (s, e) in [(0x20, 0x20), (0x40, 0x20), (0x70, 0x90), (0x00, 0x11), (0x20, 0x30)] {
            assert!(matches!(
                stream.add_region(s, e, KEY_B, AesIv128::default()),
                Err(Error::IllegalRegion { .. })
            ));
        }
        stream.add_plaintext_region(0x80, 0x100).unwrap();
        assert_eq!(stream.regions().len(), 2);
    }

    #[test]
    fn writes_encrypt_in_place() {
        let clear = plain(0x300);
        let ctr = AesIv128::from_upper_iv(7, 0);
        let mut stream = KeyedRegionStream::new(Cursor::new(vec![0u8; 0x300])).unwrap();
        stream.add_region(0x100, 0x300, KEY_A, ctr).unwrap();
        stream.write_all(&clear).unwrap();

        let raw = stream.into_inner().into_inner();
        let mut expected = clear.clone();
        ctr_xor(&KEY_A, &ctr, &mut expected[0x100..]);
        assert_eq!(raw, expected);
    }

    #[test]
    fn seeking_past_the_end_fails() {
        let (_, mut stream) = fixture();
        let err = stream.seek(SeekFrom::Start(0x40000)).unwrap_err();
        assert!(matches!(Error::from(err), Error::OutOfBounds { .. }));
    }
}
