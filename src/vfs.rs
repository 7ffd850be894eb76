//! Read-only virtual filesystem over a verified section.
//!
//! A [`FileSystemView`] is what the directory-table readers produce: a flat
//! listing of files, each a byte range of the section's data stream. Every
//! opened file gets its own cursor over the shared stream.

use std::io::{Read, Seek, SeekFrom};

use crate::stream::{ReadSeek, SharedStream, SubStream};
use crate::{Error, Result};

/// One file of a section filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    /// `/`-separated path without a leading slash.
    pub path: String,
    /// Absolute offset within the section data stream.
    pub offset: u64,
    pub size: u64,
}

/// Seekable stream over one [`VirtualFile`].
pub type FileStream = SubStream<SharedStream<Box<dyn ReadSeek>>>;

pub struct FileSystemView {
    source: SharedStream<Box<dyn ReadSeek>>,
    files: Vec<VirtualFile>,
}

impl FileSystemView {
    /// Build a view, rejecting files that end past the source stream.
    pub fn new(mut source: Box<dyn ReadSeek>, files: Vec<VirtualFile>) -> Result<Self> {
        let len = source.seek(SeekFrom::End(0))?;
        for file in &files {
            let end = file.offset.checked_add(file.size).ok_or(Error::InvalidRange)?;
            if end > len {
                return Err(Error::OutOfBounds {
                    offset: end,
                    size: len,
                });
            }
        }
        Ok(Self {
            source: SharedStream::new(source),
            files,
        })
    }

    pub fn files(&self) -> &[VirtualFile] {
        &self.files
    }

    /// Find a file by path. Returns [`None`] if not found.
    pub fn file(&self, path: &str) -> Option<&VirtualFile> {
        let path = path.trim_start_matches('/');
        self.files.iter().find(|f| f.path == path)
    }

    /// Open an independent stream over `file`.
    pub fn open(&self, file: &VirtualFile) -> FileStream {
        SubStream::new(self.source.clone(), file.offset, file.size)
    }

    /// Read a whole file into memory.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let file = self
            .file(path)
            .ok_or(Error::Parse("no such file in section"))?;
        let mut out = Vec::with_capacity(file.size as usize);
        self.open(file).read_to_end(&mut out)?;
        Ok(out)
    }
}
