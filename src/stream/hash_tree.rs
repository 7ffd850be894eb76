//! Hierarchical hash-tree verification.
//!
//! Both NCA hash formats reduce to the same shape: a chain of hash layers,
//! each one the concatenated SHA-256 digests of the next layer's blocks,
//! rooted in one or more master hashes stored in the FS header.
//!
//! ```text
//! master hash(es) ─ layer 0 ─ layer 1 ─ … ─ layer n-1 ─ data layer
//! ```
//!
//! | Flavor | Layers | Last partial block hashed over |
//! |--------|--------|--------------------------------|
//! | HierarchicalSha256 | one hash table (hashed as a single block) | its real length |
//! | HierarchicalIntegrity (IVFC) | up to five levels | the full block, zero padded |
//!
//! All hash layers are read and verified when the stream is constructed.
//! The data layer is verified lazily: each read fetches up to
//! `cache_block_count` blocks and checks every block it touches before any
//! byte is copied out.

use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, trace};

use super::resolve_seek;
use crate::crypto::{SHA256_SIZE, sha256};
use crate::{Error, Result};

/// Default number of data blocks fetched per cache fill.
pub const DEFAULT_CACHE_BLOCK_COUNT: usize = 16;

/// Largest block size accepted for any layer.
pub const MAX_HASH_BLOCK_SIZE: u64 = 0x100_0000;

/// One layer of a hash tree, in coordinates of the wrapped stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLayer {
    pub offset: u64,
    pub size: u64,
    /// Chunk size this layer is hashed in.
    pub block_size: u64,
}

impl HashLayer {
    pub fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size)
    }
}

/// Geometry and roots of a hash tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTreeDescriptor {
    /// Intermediate hash layers, closest to the master hash first.
    pub hash_layers: Vec<HashLayer>,
    pub data_layer: HashLayer,
    /// Hashes of the blocks of `hash_layers[0]`.
    pub master_hashes: Vec<[u8; SHA256_SIZE]>,
    /// Hash a trailing partial block over its zero-padded full block.
    pub align_hash_to_block: bool,
}

impl HashTreeDescriptor {
    /// HierarchicalSha256: a single hash table whose digest is the master
    /// hash, over a data region hashed in `block_size` chunks.
    pub fn sha256(
        master_hash: [u8; SHA256_SIZE],
        block_size: u64,
        hash_table: (u64, u64),
        data: (u64, u64),
    ) -> Self {
        Self {
            hash_layers: vec![HashLayer {
                offset: hash_table.0,
                size: hash_table.1,
                block_size: hash_table.1.max(1),
            }],
            data_layer: HashLayer {
                offset: data.0,
                size: data.1,
                block_size,
            },
            master_hashes: vec![master_hash],
            align_hash_to_block: false,
        }
    }

    /// HierarchicalIntegrity: `levels` ordered from the master hash
    /// outwards, the last one being the data level.
    pub fn integrity(levels: &[HashLayer], master_hashes: Vec<[u8; SHA256_SIZE]>) -> Result<Self> {
        let Some((data_layer, hash_layers)) = levels.split_last() else {
            return Err(Error::Parse("integrity tree without levels"));
        };
        Ok(Self {
            hash_layers: hash_layers.to_vec(),
            data_layer: *data_layer,
            master_hashes,
            align_hash_to_block: true,
        })
    }

    /// Check block sizes and that every layer lies within `len` bytes.
    fn validate(&self, len: u64) -> Result<()> {
        let all = self.hash_layers.iter().chain(std::iter::once(&self.data_layer));
        for layer in all {
            if layer.block_size == 0 {
                return Err(Error::Parse("hash block size is zero"));
            }
            if layer.block_size > MAX_HASH_BLOCK_SIZE {
                return Err(Error::Parse("hash block size too large"));
            }
            let end = layer
                .offset
                .checked_add(layer.size)
                .ok_or(Error::InvalidRange)?;
            if end > len {
                return Err(Error::OutOfBounds {
                    offset: end,
                    size: len,
                });
            }
        }
        if self.master_hashes.is_empty() {
            return Err(Error::Parse("hash tree without master hash"));
        }
        Ok(())
    }
}

/// Read-only view of a verified data layer.
pub struct HashTreeVerifyStream<S> {
    inner: S,
    data_layer: HashLayer,
    align_hash_to_block: bool,
    layer_index: usize,
    /// Expected digests of every data block.
    block_hashes: Vec<u8>,
    pos: u64,
    cache: Vec<u8>,
    cache_first_block: u64,
    cache_loaded: usize,
    cache_verified: Vec<bool>,
}

impl<S: Read + Seek> HashTreeVerifyStream<S> {
    /// Verify every hash layer of `descriptor` and wrap `inner`.
    ///
    /// Fails with [`Error::HashVerificationFailed`] at the first bad block
    /// in any hash layer, and with [`Error::OutOfBounds`] if a layer ends
    /// past `inner`.
    pub fn new(inner: S, descriptor: &HashTreeDescriptor) -> Result<Self> {
        Self::with_cache(inner, descriptor, DEFAULT_CACHE_BLOCK_COUNT)
    }

    pub fn with_cache(
        mut inner: S,
        descriptor: &HashTreeDescriptor,
        cache_block_count: usize,
    ) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        descriptor.validate(len)?;
        let align = descriptor.align_hash_to_block;

        let mut expected: Vec<u8> = descriptor.master_hashes.concat();
        for (index, layer) in descriptor.hash_layers.iter().enumerate() {
            let data = read_layer(&mut inner, layer)?;
            verify_blocks(&data, layer, align, &expected, index, 0)?;
            debug!(
                "hash layer {index} verified: {:#x} bytes in {} blocks",
                layer.size,
                layer.block_count()
            );
            expected = data;
        }

        let data_blocks = descriptor.data_layer.block_count();
        let needed = usize::try_from(data_blocks)
            .ok()
            .and_then(|n| n.checked_mul(SHA256_SIZE))
            .ok_or(Error::InvalidRange)?;
        if expected.len() < needed {
            return Err(Error::InputTooSmall {
                needed,
                actual: expected.len(),
            });
        }
        expected.truncate(needed);

        // Never cache more blocks than the data layer has.
        let cache_block_count = cache_block_count.clamp(1, (data_blocks as usize).max(1));
        let cache_len = cache_block_count * descriptor.data_layer.block_size as usize;

        Ok(Self {
            inner,
            data_layer: descriptor.data_layer,
            align_hash_to_block: align,
            layer_index: descriptor.hash_layers.len(),
            block_hashes: expected,
            pos: 0,
            cache: vec![0u8; cache_len],
            cache_first_block: 0,
            cache_loaded: 0,
            cache_verified: vec![false; cache_block_count],
        })
    }

    /// Size of the data layer.
    pub fn len(&self) -> u64 {
        self.data_layer.size
    }

    pub fn is_empty(&self) -> bool {
        self.data_layer.size == 0
    }

    fn block_size(&self) -> u64 {
        self.data_layer.block_size
    }

    fn cached(&self, block: u64) -> bool {
        block >= self.cache_first_block && block < self.cache_first_block + self.cache_loaded as u64
    }

    fn fill_cache(&mut self, first_block: u64) -> Result<()> {
        let bs = self.block_size();
        let start = first_block * bs;
        let remaining = self.data_layer.size - start;
        let len = remaining.min(self.cache.len() as u64) as usize;

        self.cache_loaded = 0;
        self.inner.seek(SeekFrom::Start(self.data_layer.offset + start))?;
        self.inner.read_exact(&mut self.cache[..len])?;
        self.cache_first_block = first_block;
        self.cache_loaded = len.div_ceil(bs as usize);
        self.cache_verified.fill(false);
        trace!(
            "hash tree cache filled: blocks {first_block}..{}",
            first_block + self.cache_loaded as u64
        );
        Ok(())
    }

    /// Ensure `block` is cached and verified; returns its slot.
    fn verified_slot(&mut self, block: u64) -> Result<usize> {
        if !self.cached(block) {
            self.fill_cache(block)?;
        }
        let slot = (block - self.cache_first_block) as usize;
        if !self.cache_verified[slot] {
            let bs = self.block_size() as usize;
            let len = (self.data_layer.size - block * bs as u64).min(bs as u64) as usize;
            let start = slot * bs;
            let digest = if self.align_hash_to_block && len < bs {
                self.cache[start + len..start + bs].fill(0);
                sha256(&self.cache[start..start + bs])
            } else {
                sha256(&self.cache[start..start + len])
            };
            let at = block as usize * SHA256_SIZE;
            if digest[..] != self.block_hashes[at..at + SHA256_SIZE] {
                return Err(Error::HashVerificationFailed {
                    layer: self.layer_index,
                    block,
                });
            }
            self.cache_verified[slot] = true;
        }
        Ok(slot)
    }
}

fn read_layer<S: Read + Seek>(inner: &mut S, layer: &HashLayer) -> Result<Vec<u8>> {
    let len = usize::try_from(layer.size).map_err(|_| Error::InvalidRange)?;
    let mut data = vec![0u8; len];
    inner.seek(SeekFrom::Start(layer.offset))?;
    inner.read_exact(&mut data)?;
    Ok(data)
}

fn verify_blocks(
    data: &[u8],
    layer: &HashLayer,
    align: bool,
    expected: &[u8],
    layer_index: usize,
    first_block: u64,
) -> Result<()> {
    let bs = layer.block_size as usize;
    let mut padded = Vec::new();
    for (i, chunk) in data.chunks(bs).enumerate() {
        let block = first_block + i as u64;
        let digest = if align && chunk.len() < bs {
            padded.clear();
            padded.extend_from_slice(chunk);
            padded.resize(bs, 0);
            sha256(&padded)
        } else {
            sha256(chunk)
        };
        let at = block as usize * SHA256_SIZE;
        if expected.get(at..at + SHA256_SIZE) != Some(&digest[..]) {
            return Err(Error::HashVerificationFailed {
                layer: layer_index,
                block,
            });
        }
    }
    Ok(())
}

impl<S: Read + Seek> Read for HashTreeVerifyStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0usize;
        let bs = self.block_size();
        while done < buf.len() && self.pos < self.data_layer.size {
            let block = self.pos / bs;
            let slot = self.verified_slot(block)?;
            let in_block = (self.pos % bs) as usize;
            let block_len = (self.data_layer.size - block * bs).min(bs) as usize;
            let n = (block_len - in_block).min(buf.len() - done);
            let start = slot * bs as usize + in_block;
            buf[done..done + n].copy_from_slice(&self.cache[start..start + n]);
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }
}

impl<S: Read + Seek> Seek for HashTreeVerifyStream<S> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.data_layer.size, from)?;
        Ok(self.pos)
    }
}
