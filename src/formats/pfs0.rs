//! PFS0 (PartitionFS) - flat archive container.
//!
//! Used as the outer container for NSP files and embedded inside NCAs as the
//! ExeFS and Logo sections.
//!
//! ## Layout
//! ```text
//! [0x00] Magic "PFS0"              (4 bytes)
//! [0x04] FileCount                 (u32 LE)
//! [0x08] StringTableSize           (u32 LE)
//! [0x0C] Reserved (always 0)       (4 bytes)
//! [0x10] EntryTable                (FileCount × 0x18 bytes)
//! [0x10 + FileCount×0x18]
//!        StringTable               (StringTableSize bytes)
//! [0x10 + FileCount×0x18 + StringTableSize]
//!        FileData                  (remaining bytes)
//! ```
//!
//! ## File Entry (0x18 bytes)
//! ```text
//! [0x00] Offset  - relative to the data section start (u64 LE)
//! [0x08] Size    - in bytes (u64 LE)
//! [0x10] NameOffset - byte offset into the string table (u32 LE)
//! [0x14] Reserved   (u32)
//! ```

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::utils::{bytesv, magic, null_string};
use crate::vfs::VirtualFile;
use crate::{Error, Result};

const HEADER_SIZE: u64 = 0x10;
const ENTRY_SIZE: u64 = 0x18;

/// Parsed PFS0 container (metadata only).
#[derive(Debug)]
pub struct Pfs0 {
    /// All file entries in declaration order.
    pub files: Vec<Pfs0File>,
    /// Absolute byte offset (from the start of the stream) to the file
    /// data section.
    pub data_offset: u64,
}

/// Metadata for a single file inside a PFS0.
#[derive(Debug, Clone)]
pub struct Pfs0File {
    /// File name decoded from the string table.
    pub name: String,
    /// Offset relative to the PFS0 data section.
    pub offset: u64,
    /// File size in bytes.
    pub size: u64,
}

impl Pfs0 {
    /// Parse a PFS0 container from `r`.
    ///
    /// The reader must be positioned at the very start of the PFS0 magic.
    /// File contents are not read.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let base = r.stream_position()?;
        let len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(base))?;

        magic(r, b"PFS0")?;
        let file_count = r.read_u32::<LittleEndian>()?;
        let string_table_size = r.read_u32::<LittleEndian>()?;
        let _reserved = r.read_u32::<LittleEndian>()?;

        let header_size =
            HEADER_SIZE + file_count as u64 * ENTRY_SIZE + string_table_size as u64;
        if base + header_size > len {
            return Err(Error::InputTooSmall {
                needed: header_size as usize,
                actual: (len - base) as usize,
            });
        }

        let mut entries = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let offset = r.read_u64::<LittleEndian>()?;
            let size = r.read_u64::<LittleEndian>()?;
            let name_offset = r.read_u32::<LittleEndian>()?;
            let _reserved = r.read_u32::<LittleEndian>()?;
            entries.push((offset, size, name_offset));
        }

        let string_table = bytesv(r, string_table_size as usize)?;

        let mut files = Vec::with_capacity(file_count as usize);
        for (offset, size, name_offset) in entries {
            let name = null_string(&string_table, name_offset as usize)?;
            files.push(Pfs0File { name, offset, size });
        }

        Ok(Self {
            files,
            data_offset: base + header_size,
        })
    }

    /// File listing with offsets resolved against the parsed stream.
    pub fn virtual_files(&self) -> Result<Vec<VirtualFile>> {
        self.files
            .iter()
            .map(|f| {
                let offset = self
                    .data_offset
                    .checked_add(f.offset)
                    .ok_or(Error::InvalidRange)?;
                Ok(VirtualFile {
                    path: f.name.clone(),
                    offset,
                    size: f.size,
                })
            })
            .collect()
    }
}
