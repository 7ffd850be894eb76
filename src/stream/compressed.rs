//! Sparse, optionally LZ4-compressed section storage.
//!
//! Compacted sections describe their logical contents with a bucket tree
//! of [`CompressionEntry`] records. Each entry maps a virtual range onto a
//! physical range of the (already decrypted) section:
//!
//! | Kind | Physical bytes | Logical bytes |
//! |------|----------------|---------------|
//! | [`CompressionKind::None`]  | stored as-is | copied, zero padded past `physical_size` |
//! | [`CompressionKind::Zeros`] | none | zeros |
//! | [`CompressionKind::Lz4`]   | one raw LZ4 block | decoded, zero padded to `virtual_size` |
//!
//! Bucket tree layout, 0x4000-byte nodes:
//!
//! ```text
//! node 0      L1 header {index i32, set count i32, end offset i64}
//!             set count x i64 virtual start offset
//! node 1 + n  entry set header {index i32, entry count i32, end offset i64}
//!             entry count x 0x18-byte entry
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, trace};

use super::resolve_seek;
use crate::compression::lz4;
use crate::utils::Fields;
use crate::{Error, Result};

pub const BUCKET_NODE_SIZE: usize = 0x4000;
const NODE_HEADER_SIZE: usize = 0x10;
const ENTRY_SIZE: usize = 0x18;
const ENTRIES_PER_SET: usize = (BUCKET_NODE_SIZE - NODE_HEADER_SIZE) / ENTRY_SIZE;
const OFFSETS_PER_L1_NODE: usize = (BUCKET_NODE_SIZE - NODE_HEADER_SIZE) / 8;

/// Upper bound for both sizes of an LZ4 entry.
pub const MAX_COMPRESSED_ENTRY_SIZE: u64 = 0x40_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Zeros,
    Lz4,
}

impl CompressionKind {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Zeros),
            3 => Ok(Self::Lz4),
            other => Err(Error::UnsupportedCompressionType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionEntry {
    pub kind: CompressionKind,
    pub physical_offset: u64,
    pub physical_size: u64,
    pub virtual_offset: u64,
    /// Derived from the next entry's offset; the last entry is sized by
    /// [`CompressionOverlayStream::new`].
    pub virtual_size: u64,
}

/// `BKTR` header stored in the FS header's compression info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketTreeHeader {
    pub version: u32,
    pub entry_count: u32,
}

impl BucketTreeHeader {
    pub const SIZE: usize = 0x10;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let f = Fields::new(buf, Self::SIZE)?;
        if f.array::<4>(0) != *b"BKTR" {
            return Err(Error::BadMagic);
        }
        let version = f.u32(4);
        if version != 1 {
            return Err(Error::Parse("unsupported bucket tree version"));
        }
        let entry_count = f.u32(8) as i32;
        let entry_count = u32::try_from(entry_count)
            .map_err(|_| Error::Parse("negative bucket tree entry count"))?;
        Ok(Self {
            version,
            entry_count,
        })
    }
}

/// Parsed compression table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionTable {
    pub entries: Vec<CompressionEntry>,
    /// Virtual end offset recorded in the L1 node.
    pub end_offset: u64,
}

struct NodeHeader {
    index: i32,
    count: i32,
    end_offset: i64,
}

impl NodeHeader {
    fn read(f: &Fields<'_>, off: usize) -> Self {
        Self {
            index: f.u32(off) as i32,
            count: f.u32(off + 4) as i32,
            end_offset: f.u64(off + 8) as i64,
        }
    }
}

fn non_negative(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Parse("negative bucket tree offset"))
}

impl CompressionTable {
    /// Parse the node and entry storage described by `header`.
    pub fn parse(header: &BucketTreeHeader, table: &[u8]) -> Result<Self> {
        let entry_count = header.entry_count as usize;
        if entry_count == 0 {
            return Ok(Self {
                entries: Vec::new(),
                end_offset: 0,
            });
        }

        let set_count = entry_count.div_ceil(ENTRIES_PER_SET);
        if set_count > OFFSETS_PER_L1_NODE {
            return Err(Error::Parse("bucket tree L2 nodes are not supported"));
        }
        let f = Fields::new(table, BUCKET_NODE_SIZE * (1 + set_count))?;

        let l1 = NodeHeader::read(&f, 0);
        if l1.index != 0 || l1.count as usize != set_count {
            return Err(Error::Parse("malformed bucket tree L1 node"));
        }
        let end_offset = non_negative(l1.end_offset)?;

        let mut entries: Vec<CompressionEntry> = Vec::with_capacity(entry_count);
        let mut previous: Option<u64> = None;
        for set in 0..set_count {
            let base = BUCKET_NODE_SIZE * (1 + set);
            let node = NodeHeader::read(&f, base);
            let count = usize::try_from(node.count)
                .map_err(|_| Error::Parse("negative entry set count"))?;
            if node.index as usize != set || count == 0 || count > ENTRIES_PER_SET {
                return Err(Error::Parse("malformed bucket tree entry set"));
            }

            for i in 0..count {
                let off = base + NODE_HEADER_SIZE + i * ENTRY_SIZE;
                let virtual_offset = non_negative(f.u64(off) as i64)?;
                let physical_offset = non_negative(f.u64(off + 8) as i64)?;
                let kind = CompressionKind::from_raw(f.u8(off + 0x10))?;
                let physical_size = f.u32(off + 0x14) as u64;

                match previous {
                    None if virtual_offset != 0 => {
                        return Err(Error::Parse("compression table does not start at zero"));
                    }
                    Some(prev) if virtual_offset <= prev => {
                        return Err(Error::Parse("compression table offsets not increasing"));
                    }
                    _ => {}
                }
                if let Some(last) = entries.last_mut() {
                    last.virtual_size = virtual_offset - last.virtual_offset;
                }
                previous = Some(virtual_offset);

                entries.push(CompressionEntry {
                    kind,
                    physical_offset,
                    physical_size,
                    virtual_offset,
                    virtual_size: 0,
                });
            }
        }

        if entries.len() != entry_count {
            return Err(Error::Parse("bucket tree entry count mismatch"));
        }
        Ok(Self {
            entries,
            end_offset,
        })
    }
}

/// Logical view over a compacted section.
pub struct CompressionOverlayStream<S> {
    inner: S,
    entries: Vec<CompressionEntry>,
    size: u64,
    pos: u64,
    cache: Vec<u8>,
    cached: Option<usize>,
}

impl<S: Read + Seek> CompressionOverlayStream<S> {
    /// Wrap `inner` (the decrypted section) with the entries of `table`.
    ///
    /// The last entry's logical size is its stored size for
    /// [`CompressionKind::None`], its decoded size for
    /// [`CompressionKind::Lz4`], and runs to the table's end offset for
    /// [`CompressionKind::Zeros`].
    pub fn new(mut inner: S, table: CompressionTable) -> Result<Self> {
        let inner_len = inner.seek(SeekFrom::End(0))?;
        let CompressionTable {
            mut entries,
            end_offset,
        } = table;

        for (index, entry) in entries.iter().enumerate() {
            let physical_end = entry
                .physical_offset
                .checked_add(entry.physical_size)
                .ok_or(Error::InvalidRange)?;
            if physical_end > inner_len {
                return Err(Error::OutOfBounds {
                    offset: physical_end,
                    size: inner_len,
                });
            }
            if entry.kind == CompressionKind::Lz4
                && (entry.physical_size > MAX_COMPRESSED_ENTRY_SIZE
                    || entry.virtual_size > MAX_COMPRESSED_ENTRY_SIZE)
            {
                debug!("compression entry {index} exceeds the entry size limit");
                return Err(Error::Parse("compressed entry exceeds size limit"));
            }
        }

        let mut cache = Vec::new();
        let mut cached = None;
        if let Some(index) = entries.len().checked_sub(1) {
            let last = &mut entries[index];
            last.virtual_size = match last.kind {
                CompressionKind::None => last.physical_size,
                CompressionKind::Zeros => end_offset.saturating_sub(last.virtual_offset),
                CompressionKind::Lz4 => {
                    let n = decode(&mut inner, last, index, &mut cache, MAX_COMPRESSED_ENTRY_SIZE)?;
                    cache.truncate(n);
                    cached = Some(index);
                    n as u64
                }
            };
        }

        let size = entries
            .last()
            .map_or(0, |e| e.virtual_offset + e.virtual_size);
        debug!(
            "compression overlay: {} entries, {size:#x} logical bytes",
            entries.len()
        );
        Ok(Self {
            inner,
            entries,
            size,
            pos: 0,
            cache,
            cached,
        })
    }

    pub fn entries(&self) -> &[CompressionEntry] {
        &self.entries
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn entry_at(&self, pos: u64) -> usize {
        self.entries
            .partition_point(|e| e.virtual_offset <= pos)
            .saturating_sub(1)
    }

    fn load(&mut self, index: usize) -> Result<()> {
        if self.cached == Some(index) {
            return Ok(());
        }
        self.cached = None;
        let entry = self.entries[index];
        decode(&mut self.inner, &entry, index, &mut self.cache, entry.virtual_size)?;
        self.cached = Some(index);
        trace!("decoded compression entry {index}");
        Ok(())
    }
}

/// Decode the LZ4 block of `entry` into `out`, sized to `capacity` and zero
/// padded past the decoded length.
fn decode<S: Read + Seek>(
    inner: &mut S,
    entry: &CompressionEntry,
    index: usize,
    out: &mut Vec<u8>,
    capacity: u64,
) -> Result<usize> {
    let mut src = vec![0u8; entry.physical_size as usize];
    inner.seek(SeekFrom::Start(entry.physical_offset))?;
    inner.read_exact(&mut src)?;

    out.clear();
    out.resize(capacity as usize, 0);
    lz4::decompress_block(&src, out).ok_or(Error::DecompressionFailed(index))
}

impl<S: Read + Seek> Read for CompressionOverlayStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0usize;
        while done < buf.len() && self.pos < self.size {
            let index = self.entry_at(self.pos);
            let entry = self.entries[index];
            let in_entry = self.pos - entry.virtual_offset;
            let n = (entry.virtual_size - in_entry).min((buf.len() - done) as u64) as usize;
            let out = &mut buf[done..done + n];

            match entry.kind {
                CompressionKind::Zeros => out.fill(0),
                CompressionKind::None => {
                    let stored = entry.physical_size.saturating_sub(in_entry).min(n as u64) as usize;
                    self.inner
                        .seek(SeekFrom::Start(entry.physical_offset + in_entry))?;
                    self.inner.read_exact(&mut out[..stored])?;
                    out[stored..].fill(0);
                }
                CompressionKind::Lz4 => {
                    self.load(index)?;
                    let start = in_entry as usize;
                    out.copy_from_slice(&self.cache[start..start + n]);
                }
            }
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }
}

impl<S: Read + Seek> Seek for CompressionOverlayStream<S> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.size, from)?;
        Ok(self.pos)
    }
}
