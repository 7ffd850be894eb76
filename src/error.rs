//! Library-wide error and result types.
//!
//! Stream layers implement [`std::io::Read`] / [`std::io::Seek`], so their
//! failures travel inside an [`io::Error`]. The `From` conversions below
//! wrap and unwrap [`Error`] transparently, so `?` on a stream call still
//! yields the original variant (e.g. [`Error::HashVerificationFailed`]).

use std::io;

use thiserror::Error;

/// Result alias used throughout ncakit.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// None of these are retried internally. Corrupt or tampered input is
/// reported to the caller and the current operation is abandoned.
#[derive(Debug, Error)]
pub enum Error {
    /// A header or descriptor is shorter than its fixed layout.
    #[error("input too small: need {needed:#x} bytes, got {actual:#x}")]
    InputTooSmall { needed: usize, actual: usize },
    /// A magic/signature field did not match the expected value.
    #[error("bad magic value")]
    BadMagic,
    /// A format version is present in the data but not supported.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),
    /// A crypto region is empty or overlaps an existing one.
    #[error("illegal crypto region {start:#x}..{end:#x}")]
    IllegalRegion { start: u64, end: u64 },
    /// No precedence path produced the named key.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("unsupported encryption type: {0}")]
    UnsupportedEncryptionType(u8),
    #[error("unsupported hash type: {0}")]
    UnsupportedHashType(u8),
    #[error("unsupported filesystem type: {0}")]
    UnsupportedFsType(u8),
    #[error("unsupported compression type: {0}")]
    UnsupportedCompressionType(u8),
    /// A block did not hash to the value stored in the layer above it.
    ///
    /// `layer` counts from the master hash: 0 is the first hash layer, the
    /// data layer has the highest index.
    #[error("hash verification failed in layer {layer}, block {block}")]
    HashVerificationFailed { layer: usize, block: u64 },
    /// An FS header does not match its SHA-256 in the NCA header.
    #[error("fs header {0} hash mismatch")]
    FsHeaderHashMismatch(usize),
    /// A compressed block could not be decoded (or decoded to nothing).
    #[error("decompression failed for entry {0}")]
    DecompressionFailed(usize),
    /// A seek or read targeted bytes past the logical end of a stream.
    #[error("access at {offset:#x} is outside of stream of size {size:#x}")]
    OutOfBounds { offset: u64, size: u64 },
    /// Block-mode input that is not a multiple of 16 bytes.
    #[error("length {0:#x} is not a multiple of the AES block size")]
    UnalignedLength(usize),
    /// The stream ended before all expected bytes could be read.
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// A null-terminated string had no null terminator within the buffer.
    #[error("unterminated string")]
    UnterminatedName,
    /// An offset or size field would read outside the valid region.
    #[error("invalid offset or size")]
    InvalidRange,
    /// A structural constraint was violated (message describes which one).
    #[error("parse error: {0}")]
    Parse(&'static str),
    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return match e.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(inner)) => *inner,
                _ => Error::Parse("lost wrapped error"),
            };
        }
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Io(inner) => return inner,
            Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            Error::OutOfBounds { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}
