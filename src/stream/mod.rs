//! Layered, seekable stream transforms.
//!
//! Every layer implements [`std::io::Read`] + [`std::io::Seek`] over the
//! layer below it, so layers compose freely and the result can be handed to
//! any parser in [`crate::formats`]:
//!
//! ```text
//! container file ─ SharedStream ─ KeyedRegionStream ─ SubStream (partition)
//!     └─ [CompressionOverlayStream] ─ HashTreeVerifyStream ─ PFS0 / RomFS
//! ```
//!
//! | Module | Layer |
//! |--------|-------|
//! | [`keyed`]      | AES-CTR over registered byte regions |
//! | [`hash_tree`]  | HierarchicalSha256 / HierarchicalIntegrity verification |
//! | [`compressed`] | Sparse LZ4 block table |
//!
//! Each layer owns its cursor and caches. Several layers may share one
//! underlying handle through [`SharedStream`]; access is single-threaded.

pub mod compressed;
pub mod hash_tree;
pub mod keyed;

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::Error;

pub use self::compressed::{
    BucketTreeHeader, CompressionEntry, CompressionKind, CompressionOverlayStream, CompressionTable,
};
pub use self::hash_tree::{HashLayer, HashTreeDescriptor, HashTreeVerifyStream};
pub use self::keyed::{CryptoRegion, KeyedRegionStream};

/// Object-safe `Read + Seek`, used for boxed pipelines.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// Resolve a [`SeekFrom`] against a stream of `size` bytes.
///
/// Targets before 0 or after `size` are rejected with
/// [`Error::OutOfBounds`].
pub(crate) fn resolve_seek(pos: u64, size: u64, from: SeekFrom) -> io::Result<u64> {
    let target = match from {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(d) => size.checked_add_signed(d),
        SeekFrom::Current(d) => pos.checked_add_signed(d),
    };
    match target {
        Some(t) if t <= size => Ok(t),
        _ => Err(Error::OutOfBounds {
            offset: target.unwrap_or(u64::MAX),
            size,
        }
        .into()),
    }
}

/// Reference-counted handle with an independent cursor.
///
/// Cloning yields another handle to the same stream; each clone keeps its
/// own position and re-seeks the shared stream before every operation.
pub struct SharedStream<S> {
    inner: Rc<RefCell<S>>,
    pos: u64,
}

impl<S> SharedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Rc::new(RefCell::new(inner)),
            pos: 0,
        }
    }
}

impl<S> Clone for SharedStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            pos: self.pos,
        }
    }
}

impl<S: Read + Seek> Read for SharedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        inner.seek(SeekFrom::Start(self.pos))?;
        let n = inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: Write + Seek> Write for SharedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        inner.seek(SeekFrom::Start(self.pos))?;
        let n = inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.borrow_mut().flush()
    }
}

impl<S: Seek> Seek for SharedStream<S> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = match from {
            SeekFrom::Start(n) => n,
            other => {
                let mut inner = self.inner.borrow_mut();
                inner.seek(SeekFrom::Start(self.pos))?;
                inner.seek(other)?
            }
        };
        Ok(self.pos)
    }
}

/// Bounded window `[base, base + size)` of another stream.
pub struct SubStream<S> {
    inner: S,
    base: u64,
    size: u64,
    pos: u64,
}

impl<S: Seek> SubStream<S> {
    pub fn new(inner: S, base: u64, size: u64) -> Self {
        Self {
            inner,
            base,
            size,
            pos: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Seek> Read for SubStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        let len = (buf.len() as u64).min(remaining) as usize;
        if len == 0 {
            return Ok(0);
        }
        self.inner.seek(SeekFrom::Start(self.base + self.pos))?;
        let n = self.inner.read(&mut buf[..len])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: Seek> Seek for SubStream<S> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.size, from)?;
        Ok(self.pos)
    }
}
