//! RomFS - hierarchical read-only filesystem of NCA data sections.
//!
//! ## Header (0x50 bytes)
//! ```text
//! [0x00] HeaderSize          (u64 LE, 0x50)
//! [0x08] DirHashTable        (offset u64, size u64)
//! [0x18] DirMetaTable        (offset u64, size u64)
//! [0x28] FileHashTable       (offset u64, size u64)
//! [0x38] FileMetaTable       (offset u64, size u64)
//! [0x48] FileDataOffset      (u64 LE)
//! ```
//!
//! ## Directory entry
//! ```text
//! [0x00] Parent, Sibling, ChildDir, ChildFile, HashNext (u32 LE each)
//! [0x14] NameLength (u32 LE)
//! [0x18] Name (NameLength bytes, padded to 4)
//! ```
//!
//! ## File entry
//! ```text
//! [0x00] Parent, Sibling (u32 LE each)
//! [0x08] DataOffset (u64 LE, relative to FileDataOffset)
//! [0x10] DataSize   (u64 LE)
//! [0x18] HashNext, NameLength (u32 LE each)
//! [0x20] Name
//! ```
//!
//! Entry references are byte offsets into the directory or file metadata
//! table; `0xFFFFFFFF` marks an empty link. The root directory is at 0.
//! The hash tables only speed up lookups and are not read. An entry that
//! is linked twice fails the parse.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use log::debug;

use crate::utils::{Fields, bytesv};
use crate::vfs::VirtualFile;
use crate::{Error, Result};

const HEADER_SIZE: usize = 0x50;
const EMPTY: u32 = u32::MAX;
const DIR_ENTRY_SIZE: usize = 0x18;
const FILE_ENTRY_SIZE: usize = 0x20;

/// Parsed RomFS metadata.
#[derive(Debug)]
pub struct RomFs {
    pub files: Vec<VirtualFile>,
}

fn entry_name(table: &[u8], off: usize, fixed: usize, len_at: usize) -> Result<(Fields<'_>, String)> {
    let f = Fields::new(table.get(off..).ok_or(Error::InvalidRange)?, fixed)?;
    let name_len = f.u32(len_at) as usize;
    let name = table
        .get(off + fixed..off + fixed + name_len)
        .ok_or(Error::InvalidRange)?;
    Ok((f, String::from_utf8_lossy(name).into_owned()))
}

struct Walker<'a> {
    dirs: &'a [u8],
    files: &'a [u8],
    data_offset: u64,
    out: Vec<VirtualFile>,
    seen_dirs: HashSet<u32>,
    seen_files: HashSet<u32>,
}

impl Walker<'_> {
    /// Depth-first walk from the root, files of a directory before its
    /// subdirectories. Every entry may be reached once.
    fn walk(&mut self) -> Result<()> {
        self.seen_dirs.insert(0);
        let mut pending = vec![(0u32, String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let (f, _) = entry_name(self.dirs, dir as usize, DIR_ENTRY_SIZE, 0x14)?;

            let mut file = f.u32(0x0C);
            while file != EMPTY {
                if !self.seen_files.insert(file) {
                    return Err(Error::Parse("romfs metadata contains a cycle"));
                }
                let (f, name) = entry_name(self.files, file as usize, FILE_ENTRY_SIZE, 0x1C)?;
                self.out.push(VirtualFile {
                    path: format!("{prefix}{name}"),
                    offset: self
                        .data_offset
                        .checked_add(f.u64(0x08))
                        .ok_or(Error::InvalidRange)?,
                    size: f.u64(0x10),
                });
                file = f.u32(0x04);
            }

            let mut children = Vec::new();
            let mut child = f.u32(0x08);
            while child != EMPTY {
                if !self.seen_dirs.insert(child) {
                    return Err(Error::Parse("romfs metadata contains a cycle"));
                }
                let (c, name) = entry_name(self.dirs, child as usize, DIR_ENTRY_SIZE, 0x14)?;
                children.push((child, format!("{prefix}{name}/")));
                child = c.u32(0x04);
            }
            pending.extend(children.into_iter().rev());
        }
        Ok(())
    }
}

impl RomFs {
    /// Parse a RomFS image from `r`, positioned at its header.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let base = r.stream_position()?;
        let len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(base))?;
        let header = bytesv(r, HEADER_SIZE)?;
        let h = Fields::new(&header, HEADER_SIZE)?;
        if h.u64(0) != HEADER_SIZE as u64 {
            return Err(Error::BadMagic);
        }

        let mut table = |at: usize| -> Result<Vec<u8>> {
            let start = base.checked_add(h.u64(at)).ok_or(Error::InvalidRange)?;
            let end = start.checked_add(h.u64(at + 8)).ok_or(Error::InvalidRange)?;
            if end > len {
                return Err(Error::OutOfBounds { offset: end, size: len });
            }
            r.seek(SeekFrom::Start(start))?;
            bytesv(r, (end - start) as usize)
        };
        let dirs = table(0x18)?;
        let files = table(0x38)?;
        let data_offset = base.checked_add(h.u64(0x48)).ok_or(Error::InvalidRange)?;

        let mut walker = Walker {
            dirs: &dirs,
            files: &files,
            data_offset,
            out: Vec::new(),
            seen_dirs: HashSet::new(),
            seen_files: HashSet::new(),
        };
        walker.walk()?;
        debug!("romfs: {} files", walker.out.len());
        Ok(Self { files: walker.out })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    fn pad4(v: &mut Vec<u8>) {
        v.resize(v.len().next_multiple_of(4), 0);
    }

    fn dir_entry(parent: u32, sibling: u32, child: u32, file: u32, name: &str) -> Vec<u8> {
        let mut e = Vec::new();
        for v in [parent, sibling, child, file, EMPTY, name.len() as u32] {
            e.extend_from_slice(&v.to_le_bytes());
        }
        e.extend_from_slice(name.as_bytes());
        pad4(&mut e);
        e
    }

    fn file_entry(parent: u32, sibling: u32, offset: u64, size: u64, name: &str) -> Vec<u8> {
        let mut e = Vec::new();
        e.extend_from_slice(&parent.to_le_bytes());
        e.extend_from_slice(&sibling.to_le_bytes());
        e.extend_from_slice(&offset.to_le_bytes());
        e.extend_from_slice(&size.to_le_bytes());
        e.extend_from_slice(&EMPTY.to_le_bytes());
        e.extend_from_slice(&(name.len() as u32).to_le_bytes());
        e.extend_from_slice(name.as_bytes());
        pad4(&mut e);
        e
    }

    /// `/readme.txt`, `/data/x.bin`, `/data/y.bin`.
    pub(crate) fn sample() -> (Vec<u8>, Vec<(&'static str, Vec<u8>)>) {
        let contents = vec![
            ("readme.txt", b"hello romfs".to_vec()),
            ("data/x.bin", vec![0x11; 0x30]),
            ("data/y.bin", vec![0x22; 0x05]),
        ];

        // Directory table: root at 0, "data" right after it.
        let data_dir_off = DIR_ENTRY_SIZE as u32;
        let root = dir_entry(EMPTY, EMPTY, data_dir_off, 0, "");
        let readme = file_entry(0, EMPTY, 0, 11, "readme.txt");
        let x_off = readme.len() as u32;
        let y_off = x_off + (FILE_ENTRY_SIZE + 8) as u32;
        let x = file_entry(data_dir_off, y_off, 0x10, 0x30, "x.bin");
        let y = file_entry(data_dir_off, EMPTY, 0x40, 0x05, "y.bin");
        let data_dir = dir_entry(0, EMPTY, EMPTY, x_off, "data");

        let dirs = [root, data_dir].concat();
        let files = [readme, x, y].concat();
        let mut data = vec![0u8; 0x45];
        data[..11].copy_from_slice(&contents[0].1);
        data[0x10..0x40].copy_from_slice(&contents[1].1);
        data[0x40..0x45].copy_from_slice(&contents[2].1);

        let dirs_off = HEADER_SIZE as u64;
        let files_off = dirs_off + dirs.len() as u64;
        let data_off = (files_off + files.len() as u64).next_multiple_of(0x10);

        let mut image = Vec::new();
        for v in [
            HEADER_SIZE as u64,
            dirs_off,
            0,
            dirs_off,
            dirs.len() as u64,
            files_off,
            0,
            files_off,
            files.len() as u64,
            data_off,
        ] {
            image.extend_from_slice(&v.to_le_bytes());
        }
        image.extend_from_slice(&dirs);
        image.extend_from_slice(&files);
        image.resize(data_off as usize, 0);
        image.extend_from_slice(&data);
        (image, contents)
    }

    #[test]
    fn flattens_nested_directories() {
        let (image, contents) = sample();
        let romfs = RomFs::parse(&mut Cursor::new(&image)).unwrap();
        let paths: Vec<_> = romfs.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["readme.txt", "data/x.bin", "data/y.bin"]);
        for (file, (_, expected)) in romfs.files.iter().zip(&contents) {
            assert_eq!(&image[file.offset as usize..][..file.size as usize], &expected[..]);
        }
    }

    #[test]
    fn sibling_cycles_are_rejected() {
        let root = dir_entry(EMPTY, EMPTY, EMPTY, 0, "");
        let files = file_entry(0, 0, 0, 1, "loop");
        let mut image = Vec::new();
        let dirs_off = HEADER_SIZE as u64;
        let files_off = dirs_off + root.len() as u64;
        let data_off = files_off + files.len() as u64;
        for v in [
            HEADER_SIZE as u64,
            0,
            0,
            dirs_off,
            root.len() as u64,
            0,
            0,
            files_off,
            files.len() as u64,
            data_off,
        ] {
            image.extend_from_slice(&v.to_le_bytes());
        }
        image.extend_from_slice(&root);
        image.extend_from_slice(&files);
        image.push(0);
        assert!(matches!(
            RomFs::parse(&mut Cursor::new(image)),
            Err(Error::Parse(_))
        ));
    }

    /// Image holding only a directory table.
    fn dirs_only(dirs: &[u8]) -> Vec<u8> {
        let dirs_off = HEADER_SIZE as u64;
        let end = dirs_off + dirs.len() as u64;
        let mut image = Vec::new();
        for v in [HEADER_SIZE as u64, 0, 0, dirs_off, dirs.len() as u64, 0, 0, end, 0, end] {
            image.extend_from_slice(&v.to_le_bytes());
        }
        image.extend_from_slice(dirs);
        image
    }

    #[test]
    fn directory_linked_to_itself_is_rejected() {
        let mut dirs = dir_entry(EMPTY, EMPTY, 0, EMPTY, "");
        dirs.resize(DIR_ENTRY_SIZE * 200_000, 0);
        assert!(matches!(
            RomFs::parse(&mut Cursor::new(dirs_only(&dirs))),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn deep_directory_chain_walks_without_recursion() {
        const DEPTH: u32 = 20_000;
        let mut dirs = Vec::new();
        for i in 0..DEPTH {
            let child = if i + 1 < DEPTH { (i + 1) * DIR_ENTRY_SIZE as u32 } else { EMPTY };
            dirs.extend(dir_entry(EMPTY, EMPTY, child, EMPTY, ""));
        }
        let romfs = RomFs::parse(&mut Cursor::new(dirs_only(&dirs))).unwrap();
        assert!(romfs.files.is_empty());
    }

    #[test]
    fn table_past_the_stream_is_rejected() {
        let (mut image, _) = sample();
        image[0x20..0x28].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            RomFs::parse(&mut Cursor::new(&image)),
            Err(Error::InvalidRange)
        ));
        image[0x20..0x28].copy_from_slice(&0x10_0000u64.to_le_bytes());
        assert!(matches!(
            RomFs::parse(&mut Cursor::new(image)),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn rejects_wrong_header_size() {
        let (mut image, _) = sample();
        image[0] = 0x40;
        assert!(matches!(RomFs::parse(&mut Cursor::new(image)), Err(Error::BadMagic)));
    }
}
