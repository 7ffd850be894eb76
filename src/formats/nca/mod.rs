//! NCA (Nintendo Content Archive) - primary encrypted content container.
//!
//! ## Encryption
//! The first 0xC00 bytes are AES-128-XTS encrypted (sector size 0x200,
//! big-endian sector index tweak). Section data is AES-128-CTR encrypted
//! with a key unwrapped from the key area or from a title key.
//! [`reader::Nca`] performs both and hands out verified section streams;
//! [`NcaHeader::parse`] expects **already-decrypted** header bytes.
//!
//! ## Header Layout (after decryption)
//! ```text
//! [0x000] RSA-2048 sig[0]  (0x100) - fixed key, over [0x200..0x400]
//! [0x100] RSA-2048 sig[1]  (0x100) - NPDM key
//! [0x200] Magic            NCA3/NCA2/NCA1/NCA0
//! [0x204] DistributionType (1 byte)
//! [0x205] ContentType      (1 byte)
//! [0x206] KeyGenerationOld (1 byte)
//! [0x207] KeyAreaEncKeyIdx (1 byte)
//! [0x208] ContentSize      (u64 LE)
//! [0x210] ProgramId        (u64 LE)
//! [0x218] ContentIndex     (u32 LE)
//! [0x21C] SdkAddonVersion  (u32 LE)
//! [0x220] KeyGeneration    (1 byte)
//! [0x221] SignatureKeyGen  (1 byte, 9.0.0+)
//! [0x222] Reserved         (0xE bytes)
//! [0x230] RightsId         (0x10 bytes)
//! [0x240] FsEntries        (4 × 0x10 bytes)
//! [0x280] FsHeaderHashes   (4 × 0x20 bytes SHA-256)
//! [0x300] EncryptedKeyArea (4 × 0x10 bytes)
//! [0x400] FsHeaders        (4 × 0x200 bytes, see [`fs_header`])
//! ```

pub mod fs_header;
pub mod reader;

pub use self::fs_header::{EncryptionType, FsHeader, FsType, HashType};
pub use self::reader::{
    ContentKeyMaterial, KeyAreaEntry, KeySource, Nca, NcaOptions, PartitionEntry, SignatureStatus,
};

use crate::crypto::SHA256_SIZE;
use crate::utils::Fields;
use crate::{Error, Result};

/// Size of the full encrypted header, FS headers included.
pub const HEADER_SIZE: usize = 0xC00;
/// Size of the main header that precedes the FS headers.
pub const MAIN_HEADER_SIZE: usize = 0x400;
/// Unit of the section offsets in [`FsEntry`].
pub const MEDIA_BLOCK_SIZE: u64 = 0x200;
/// Number of section slots.
pub const SECTION_COUNT: usize = 4;

/// Distribution type for an NCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionType {
    Download,
    GameCard,
    Unknown(u8),
}

impl From<u8> for DistributionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Download,
            1 => Self::GameCard,
            x => Self::Unknown(x),
        }
    }
}

/// Content type for an NCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Program,
            1 => Self::Meta,
            2 => Self::Control,
            3 => Self::Manual,
            4 => Self::Data,
            5 => Self::PublicData,
            x => Self::Unknown(x),
        }
    }
}

/// A section entry pointing to a filesystem region within the NCA.
///
/// Offsets are in 0x200-byte media blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsEntry {
    /// Start offset in media blocks (multiply by 0x200 for bytes).
    pub start_block: u32,
    /// End offset in media blocks.
    pub end_block: u32,
}

impl FsEntry {
    pub fn is_empty(&self) -> bool {
        self.start_block == 0 && self.end_block == 0
    }

    /// Byte range `(offset, size)` of the section.
    pub fn byte_range(&self) -> Result<(u64, u64)> {
        if self.end_block < self.start_block {
            return Err(Error::InvalidRange);
        }
        Ok((
            self.start_block as u64 * MEDIA_BLOCK_SIZE,
            (self.end_block - self.start_block) as u64 * MEDIA_BLOCK_SIZE,
        ))
    }
}

/// Parsed NCA header (from decrypted bytes).
#[derive(Debug, Clone)]
pub struct NcaHeader {
    /// NCA format version: 2 or 3.
    pub version: u8,
    pub distribution_type: DistributionType,
    pub content_type: ContentType,
    /// Effective key generation (max of KeyGenerationOld and KeyGeneration).
    pub key_generation: u8,
    /// Key area encryption key index (0=App, 1=Ocean, 2=System).
    pub key_area_enc_key_index: u8,
    /// Total content size in bytes.
    pub content_size: u64,
    /// Title/program ID.
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_addon_version: u32,
    /// Selects the fixed key the header is signed with.
    pub signature_key_generation: u8,
    /// Rights ID (all zeros if no titlekey crypto).
    pub rights_id: [u8; 16],
    /// Up to 4 filesystem section descriptors.
    pub fs_entries: [FsEntry; SECTION_COUNT],
    /// SHA-256 hashes of the FsHeaders for each section.
    pub fs_header_hashes: [[u8; SHA256_SIZE]; SECTION_COUNT],
    /// Encrypted key area (4 × 16 bytes; used when rights_id is all zeros).
    pub encrypted_key_area: [[u8; 16]; SECTION_COUNT],
}

/// Format version from the magic at 0x200, if it is a known NCA magic.
pub(crate) fn magic_version(magic: &[u8]) -> Option<u8> {
    match magic {
        b"NCA3" => Some(3),
        b"NCA2" => Some(2),
        b"NCA1" => Some(1),
        b"NCA0" => Some(0),
        _ => None,
    }
}

impl NcaHeader {
    /// Parse the main header from **already-decrypted** bytes.
    ///
    /// `buf` must hold at least the first 0x400 bytes of the container.
    /// NCA0 and NCA1 fail with [`Error::UnsupportedVersion`], anything else
    /// that is not an NCA magic with [`Error::BadMagic`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let f = Fields::new(buf, MAIN_HEADER_SIZE)?;

        let version = magic_version(f.slice(0x200, 4)).ok_or(Error::BadMagic)?;
        if version < 2 {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut fs_entries = [FsEntry::default(); SECTION_COUNT];
        let mut fs_header_hashes = [[0u8; SHA256_SIZE]; SECTION_COUNT];
        let mut encrypted_key_area = [[0u8; 16]; SECTION_COUNT];
        for i in 0..SECTION_COUNT {
            fs_entries[i] = FsEntry {
                start_block: f.u32(0x240 + i * 0x10),
                end_block: f.u32(0x244 + i * 0x10),
            };
            fs_header_hashes[i] = f.array(0x280 + i * SHA256_SIZE);
            encrypted_key_area[i] = f.array(0x300 + i * 0x10);
        }

        Ok(Self {
            version,
            distribution_type: f.u8(0x204).into(),
            content_type: f.u8(0x205).into(),
            key_generation: f.u8(0x206).max(f.u8(0x220)),
            key_area_enc_key_index: f.u8(0x207),
            content_size: f.u64(0x208),
            program_id: f.u64(0x210),
            content_index: f.u32(0x218),
            sdk_addon_version: f.u32(0x21C),
            signature_key_generation: f.u8(0x221),
            rights_id: f.array(0x230),
            fs_entries,
            fs_header_hashes,
            encrypted_key_area,
        })
    }

    /// Index into the key tables: generation 0 and 1 both use revision 0.
    pub fn key_revision(&self) -> u8 {
        self.key_generation.saturating_sub(1)
    }

    /// Returns true if the NCA uses titlekey crypto (RightsId is not all zeros).
    pub fn uses_titlekey_crypto(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    /// Returns the byte offset within the NCA of the given section.
    pub fn section_offset(&self, section: usize) -> Option<u64> {
        let e = self.fs_entries.get(section)?;
        if e.is_empty() {
            None
        } else {
            Some(e.start_block as u64 * MEDIA_BLOCK_SIZE)
        }
    }
}
