//! Per-section FS header (0x200 bytes, at 0x400 + 0x200 × index).
//!
//! ```text
//! [0x000] Version            (u16 LE)
//! [0x002] FsType             (1 byte)
//! [0x003] HashType           (1 byte)
//! [0x004] EncryptionType     (1 byte)
//! [0x005] MetaDataHashType   (1 byte)
//! [0x008] HashData           (0xF8 bytes, layout depends on HashType)
//! [0x100] PatchInfo          (0x40 bytes)
//! [0x140] UpperCounter       (u64 LE)
//! [0x148] SparseInfo         (0x30 bytes)
//! [0x178] CompressionInfo    (table offset u64, table size u64, BKTR header)
//! [0x1A0] MetaDataHashInfo   (0x30 bytes)
//! ```

use crate::crypto::SHA256_SIZE;
use crate::stream::compressed::BucketTreeHeader;
use crate::stream::{HashLayer, HashTreeDescriptor};
use crate::utils::Fields;
use crate::{Error, Result};

pub const FS_HEADER_SIZE: usize = 0x200;
const HASH_DATA_OFFSET: usize = 0x08;
const HASH_DATA_SIZE: usize = 0xF8;

const IVFC_MAX_LEVELS: usize = 6;
const IVFC_LEVELS_OFFSET: usize = 0x10;
const IVFC_MASTER_HASH_OFFSET: usize = 0xC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    RomFs,
    PartitionFs,
    Unknown(u8),
}

impl From<u8> for FsType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::RomFs,
            1 => Self::PartitionFs,
            x => Self::Unknown(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// Chosen by format: integrity for RomFS, SHA-256 for PartitionFS.
    Auto,
    None,
    HierarchicalSha256,
    HierarchicalIntegrity,
    AutoSha3,
    HierarchicalSha3256,
    HierarchicalIntegritySha3,
    Unknown(u8),
}

impl From<u8> for HashType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::HierarchicalSha256,
            3 => Self::HierarchicalIntegrity,
            4 => Self::AutoSha3,
            5 => Self::HierarchicalSha3256,
            6 => Self::HierarchicalIntegritySha3,
            x => Self::Unknown(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    Auto,
    None,
    AesXts,
    AesCtr,
    AesCtrEx,
    /// AES-CTR over the data, hash layers stored in the clear.
    AesCtrSkipLayerHash,
    AesCtrExSkipLayerHash,
    Unknown(u8),
}

impl From<u8> for EncryptionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::AesXts,
            3 => Self::AesCtr,
            4 => Self::AesCtrEx,
            5 => Self::AesCtrSkipLayerHash,
            6 => Self::AesCtrExSkipLayerHash,
            x => Self::Unknown(x),
        }
    }
}

/// Location of a section's compression table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionInfo {
    /// Offset of the bucket tree storage within the section.
    pub table_offset: u64,
    pub table_size: u64,
    pub bucket: BucketTreeHeader,
}

#[derive(Debug, Clone)]
pub struct FsHeader {
    pub version: u16,
    pub fs_type: FsType,
    pub hash_type: HashType,
    pub encryption_type: EncryptionType,
    /// Upper half of the section's AES-CTR counter.
    pub upper_iv: u64,
    pub compression: Option<CompressionInfo>,
    raw_hash_type: u8,
    raw_encryption_type: u8,
    hash_data: [u8; HASH_DATA_SIZE],
}

impl FsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let f = Fields::new(buf, FS_HEADER_SIZE)?;

        let table_size = f.u64(0x180);
        let compression = if table_size != 0 {
            Some(CompressionInfo {
                table_offset: f.u64(0x178),
                table_size,
                bucket: BucketTreeHeader::parse(f.slice(0x188, BucketTreeHeader::SIZE))?,
            })
        } else {
            None
        };

        Ok(Self {
            version: f.u16(0x00),
            fs_type: f.u8(0x02).into(),
            hash_type: f.u8(0x03).into(),
            encryption_type: f.u8(0x04).into(),
            upper_iv: f.u64(0x140),
            compression,
            raw_hash_type: f.u8(0x03),
            raw_encryption_type: f.u8(0x04),
            hash_data: f.array(HASH_DATA_OFFSET),
        })
    }

    /// `Auto` resolved by format type.
    pub fn effective_hash_type(&self) -> HashType {
        match (self.hash_type, self.fs_type) {
            (HashType::Auto, FsType::RomFs) => HashType::HierarchicalIntegrity,
            (HashType::Auto, FsType::PartitionFs) => HashType::HierarchicalSha256,
            (other, _) => other,
        }
    }

    pub(crate) fn raw_encryption_type(&self) -> u8 {
        self.raw_encryption_type
    }

    /// Hash tree of the section, or `None` for unhashed sections.
    ///
    /// Layer offsets are relative to the section start.
    pub fn hash_tree(&self) -> Result<Option<HashTreeDescriptor>> {
        match self.effective_hash_type() {
            HashType::None => Ok(None),
            HashType::HierarchicalSha256 => self.sha256_tree().map(Some),
            HashType::HierarchicalIntegrity => self.integrity_tree().map(Some),
            _ => Err(Error::UnsupportedHashType(self.raw_hash_type)),
        }
    }

    fn sha256_tree(&self) -> Result<HashTreeDescriptor> {
        let f = Fields::new(&self.hash_data, HASH_DATA_SIZE)?;
        let block_size = f.u32(0x20) as u64;
        if f.u32(0x24) != 2 {
            return Err(Error::Parse("unsupported sha256 hash layer count"));
        }
        let region = |i: usize| (f.u64(0x28 + i * 0x10), f.u64(0x30 + i * 0x10));
        Ok(HashTreeDescriptor::sha256(
            f.array(0x00),
            block_size,
            region(0),
            region(1),
        ))
    }

    fn integrity_tree(&self) -> Result<HashTreeDescriptor> {
        let f = Fields::new(&self.hash_data, HASH_DATA_SIZE)?;
        if f.slice(0, 4) != b"IVFC" {
            return Err(Error::BadMagic);
        }
        let master_hash_size = f.u32(0x08) as usize;
        let level_count = (f.u32(0x0C) as usize)
            .checked_sub(1)
            .filter(|n| (1..=IVFC_MAX_LEVELS).contains(n))
            .ok_or(Error::Parse("unsupported integrity level count"))?;
        if master_hash_size == 0
            || master_hash_size % SHA256_SIZE != 0
            || IVFC_MASTER_HASH_OFFSET + master_hash_size > HASH_DATA_SIZE
        {
            return Err(Error::Parse("invalid integrity master hash size"));
        }

        let mut levels = Vec::with_capacity(level_count);
        for i in 0..level_count {
            let at = IVFC_LEVELS_OFFSET + i * 0x18;
            let log2 = f.u32(at + 0x10);
            if !(4..32).contains(&log2) {
                return Err(Error::Parse("invalid integrity block size"));
            }
            levels.push(HashLayer {
                offset: f.u64(at),
                size: f.u64(at + 0x08),
                block_size: 1 << log2,
            });
        }

        let master_hashes = f
            .slice(IVFC_MASTER_HASH_OFFSET, master_hash_size)
            .chunks_exact(SHA256_SIZE)
            .map(|c| {
                let mut h = [0u8; SHA256_SIZE];
                h.copy_from_slice(c);
                h
            })
            .collect();
        HashTreeDescriptor::integrity(&levels, master_hashes)
    }
}
