//! Container assembly: header decryption, body key resolution and the
//! per-section stream pipeline.
//!
//! [`Nca::open`] walks these stages, logging each at `debug` level:
//!
//! ```text
//! header read -> header decrypted -> keys resolved -> partitions configured
//!   -> (signature validated) -> ready
//! ```
//!
//! Each section then opens as
//!
//! ```text
//! SharedStream ─ KeyedRegionStream ─ SubStream ─ [CompressionOverlayStream]
//!   ─ [HashTreeVerifyStream] ─ Pfs0 / RomFs ─ FileSystemView
//! ```

use std::io::{Read, Seek, SeekFrom};

use log::{debug, warn};
use rsa::{BigUint, Pss, RsaPublicKey};
use sha2::Sha256;

use super::fs_header::{CompressionInfo, FS_HEADER_SIZE};
use super::{
    EncryptionType, FsHeader, FsType, HEADER_SIZE, MAIN_HEADER_SIZE, NcaHeader, SECTION_COUNT,
    magic_version,
};
use crate::crypto::aes::ecb_decrypt;
use crate::crypto::{AesIv128, AesKey128, SHA256_SIZE, XtsCipher, sha256};
use crate::formats::pfs0::Pfs0;
use crate::formats::romfs::RomFs;
use crate::keys::{KaekIndex, KeySet, TitleKeyResolver};
use crate::stream::compressed::CompressionTable;
use crate::stream::hash_tree::DEFAULT_CACHE_BLOCK_COUNT;
use crate::stream::{
    CompressionOverlayStream, HashTreeDescriptor, HashTreeVerifyStream, KeyedRegionStream,
    ReadSeek, SharedStream, SubStream,
};
use crate::utils::bytesv;
use crate::vfs::FileSystemView;
use crate::{Error, Result};

const HEADER_SECTOR_SIZE: usize = 0x200;
/// Key area slot holding the AES-CTR body key.
const KEY_AREA_CTR_INDEX: usize = 2;

/// Operator overrides for opening an NCA.
#[derive(Debug, Clone)]
pub struct NcaOptions {
    /// Already decrypted body key.
    pub body_key: Option<AesKey128>,
    /// Encrypted title key, unwrapped with the title KEK of the key revision.
    pub encrypted_title_key: Option<[u8; 16]>,
    /// Check the header signature against the fixed key modulus.
    pub verify_signature: bool,
    /// Data blocks fetched per hash-tree cache fill.
    pub hash_cache_blocks: usize,
}

impl Default for NcaOptions {
    fn default() -> Self {
        Self {
            body_key: None,
            encrypted_title_key: None,
            verify_signature: true,
            hash_cache_blocks: DEFAULT_CACHE_BLOCK_COUNT,
        }
    }
}

/// Which path produced the body key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    TitleKeyResolver,
    OperatorBodyKey,
    OperatorTitleKey,
    KeyArea,
}

#[derive(Debug, Clone)]
pub struct KeyAreaEntry {
    pub index: usize,
    pub encrypted: [u8; 16],
    /// `None` if the KAEK for this archive was not available.
    pub decrypted: Option<AesKey128>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentKeyMaterial {
    pub key_area: Vec<KeyAreaEntry>,
    pub body_key: Option<AesKey128>,
    pub source: Option<KeySource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    Invalid,
    /// Disabled, or the fixed key modulus was not loaded.
    Unchecked,
}

/// One populated section slot.
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub header_index: usize,
    /// Absolute byte offset within the container.
    pub offset: u64,
    pub size: u64,
    pub fs_header_hash: [u8; SHA256_SIZE],
    pub fs_header: FsHeader,
}

impl PartitionEntry {
    fn end(&self) -> Result<u64> {
        self.offset.checked_add(self.size).ok_or(Error::InvalidRange)
    }
}

/// An opened NCA.
pub struct Nca<S> {
    storage: SharedStream<S>,
    len: u64,
    header: NcaHeader,
    partitions: Vec<PartitionEntry>,
    keys: ContentKeyMaterial,
    /// Name of the key that would have produced the body key.
    missing_key: String,
    signature: SignatureStatus,
    hash_cache_blocks: usize,
}

fn decrypt_header(raw: &mut [u8], xts: &XtsCipher) -> Result<()> {
    xts.decrypt(&mut raw[..MAIN_HEADER_SIZE], 0, HEADER_SECTOR_SIZE)?;
    match magic_version(&raw[0x200..0x204]) {
        Some(3) => xts.decrypt(&mut raw[MAIN_HEADER_SIZE..], 2, HEADER_SECTOR_SIZE),
        // Every NCA2 FS header is encrypted as sector 0.
        Some(2) => raw[MAIN_HEADER_SIZE..]
            .chunks_exact_mut(HEADER_SECTOR_SIZE)
            .try_for_each(|sector| xts.decrypt(sector, 0, HEADER_SECTOR_SIZE)),
        _ => Ok(()),
    }
}

fn verify_header_signature(raw: &[u8], modulus: &[u8]) -> bool {
    let Ok(key) = RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from(65537u64))
    else {
        return false;
    };
    let digest = sha256(&raw[0x200..0x400]);
    key.verify(Pss::new::<Sha256>(), &digest, &raw[..0x100]).is_ok()
}

fn resolve_keys(
    header: &NcaHeader,
    keys: &KeySet,
    resolver: &dyn TitleKeyResolver,
    options: &NcaOptions,
) -> (ContentKeyMaterial, String) {
    let revision = header.key_revision();
    // An unknown index only matters once the key area is the last resort.
    let kaek_index = KaekIndex::try_from(header.key_area_enc_key_index).ok();
    let kaek = kaek_index.and_then(|index| keys.get_kaek(index, revision));

    let key_area: Vec<KeyAreaEntry> = header
        .encrypted_key_area
        .iter()
        .enumerate()
        .map(|(index, encrypted)| KeyAreaEntry {
            index,
            encrypted: *encrypted,
            decrypted: kaek.map(|k| AesKey128(ecb_decrypt(k, encrypted))),
        })
        .collect();

    let rights = header.uses_titlekey_crypto();
    let missing = if rights {
        format!("title key for rights id {}", hex::encode(header.rights_id))
    } else if let Some(index) = kaek_index {
        let name = format!("{index:?}").to_ascii_lowercase();
        format!("key_area_key_{name}_{revision:02x}")
    } else {
        format!(
            "key area key for unknown index {}",
            header.key_area_enc_key_index
        )
    };

    let resolved = rights
        .then(|| resolver.resolve_title_key(&header.rights_id, revision))
        .flatten()
        .map(|k| (k, KeySource::TitleKeyResolver))
        .or_else(|| options.body_key.map(|k| (k, KeySource::OperatorBodyKey)))
        .or_else(|| {
            let encrypted = options.encrypted_title_key.as_ref()?;
            let kek = keys.get_titlekek(revision)?;
            Some((AesKey128(ecb_decrypt(kek, encrypted)), KeySource::OperatorTitleKey))
        })
        .or_else(|| {
            if rights {
                return None;
            }
            let key = key_area[KEY_AREA_CTR_INDEX].decrypted?;
            Some((key, KeySource::KeyArea))
        });

    let (body_key, source) = resolved.unzip();
    (
        ContentKeyMaterial {
            key_area,
            body_key,
            source,
        },
        missing,
    )
}

/// Register AES-CTR regions around plaintext hash layers.
fn add_skip_layer_hash_regions<S: Read + Seek>(
    keyed: &mut KeyedRegionStream<S>,
    part: &PartitionEntry,
    tree: Option<&HashTreeDescriptor>,
    key: AesKey128,
) -> Result<()> {
    let end = part.end()?;
    let mut plain: Vec<(u64, u64)> = tree
        .map(|t| {
            t.hash_layers
                .iter()
                .map(|l| {
                    let start = (part.offset + l.offset).min(end);
                    (start, (start + l.size).min(end))
                })
                .filter(|(s, e)| s < e)
                .collect()
        })
        .unwrap_or_default();
    plain.sort_unstable();

    let upper = part.fs_header.upper_iv;
    let mut cursor = part.offset;
    for (start, stop) in plain {
        let start = start.max(cursor);
        if stop <= start {
            continue;
        }
        if start > cursor {
            keyed.add_region(cursor, start, key, AesIv128::from_upper_iv(upper, cursor))?;
        }
        keyed.add_plaintext_region(start, stop)?;
        cursor = stop;
    }
    if cursor < end {
        keyed.add_region(cursor, end, key, AesIv128::from_upper_iv(upper, cursor))?;
    }
    Ok(())
}

/// Read the table storage, which must lie inside the section.
fn read_compression_table<R: Read + Seek>(
    section: &mut R,
    info: &CompressionInfo,
) -> Result<CompressionTable> {
    let len = section.seek(SeekFrom::End(0))?;
    let end = info
        .table_offset
        .checked_add(info.table_size)
        .ok_or(Error::InvalidRange)?;
    if end > len {
        return Err(Error::OutOfBounds {
            offset: end,
            size: len,
        });
    }
    section.seek(SeekFrom::Start(info.table_offset))?;
    let table = bytesv(section, info.table_size as usize)?;
    CompressionTable::parse(&info.bucket, &table)
}

impl<S: Read + Seek + 'static> Nca<S> {
    /// Open an NCA, resolving title keys from `keys`.
    pub fn open(storage: S, keys: &KeySet, options: &NcaOptions) -> Result<Self> {
        Self::open_with_resolver(storage, keys, keys, options)
    }

    /// Open an NCA with a separate title key source (e.g. a ticket store).
    pub fn open_with_resolver(
        storage: S,
        keys: &KeySet,
        resolver: &dyn TitleKeyResolver,
        options: &NcaOptions,
    ) -> Result<Self> {
        let mut storage = SharedStream::new(storage);
        let len = storage.seek(SeekFrom::End(0))?;
        if len < HEADER_SIZE as u64 {
            return Err(Error::InputTooSmall {
                needed: HEADER_SIZE,
                actual: len as usize,
            });
        }
        storage.seek(SeekFrom::Start(0))?;
        let mut raw = bytesv(&mut storage, HEADER_SIZE)?;
        debug!("nca: header read ({len:#x} byte container)");

        let header_key = keys
            .header_key
            .as_ref()
            .ok_or_else(|| Error::KeyUnavailable("header_key".into()))?;
        decrypt_header(&mut raw, &XtsCipher::new(header_key))?;
        let header = NcaHeader::parse(&raw)?;
        debug!(
            "nca: header decrypted: NCA{}, program id {:016x}, {:?}, key generation {}",
            header.version, header.program_id, header.content_type, header.key_generation
        );

        let (key_material, missing_key) = resolve_keys(&header, keys, resolver, options);
        match key_material.source {
            Some(source) => debug!("nca: keys resolved via {source:?}"),
            None => warn!("nca: no body key available ({missing_key})"),
        }

        let mut partitions = Vec::new();
        for index in 0..SECTION_COUNT {
            let entry = header.fs_entries[index];
            if entry.is_empty() {
                continue;
            }
            let at = MAIN_HEADER_SIZE + index * FS_HEADER_SIZE;
            let raw_fs = &raw[at..at + FS_HEADER_SIZE];
            let expected = header.fs_header_hashes[index];
            if sha256(raw_fs) != expected {
                return Err(Error::FsHeaderHashMismatch(index));
            }
            let (offset, size) = entry.byte_range()?;
            let fs_header = FsHeader::parse(raw_fs)?;
            debug!(
                "nca: section {index}: {offset:#x}+{size:#x}, {:?}, {:?}, {:?}",
                fs_header.fs_type, fs_header.hash_type, fs_header.encryption_type
            );
            partitions.push(PartitionEntry {
                header_index: index,
                offset,
                size,
                fs_header_hash: expected,
                fs_header,
            });
        }
        debug!("nca: {} partitions configured", partitions.len());

        let signature = if !options.verify_signature {
            SignatureStatus::Unchecked
        } else if let Some(modulus) = keys.get_header_modulus(header.signature_key_generation) {
            if verify_header_signature(&raw, modulus) {
                debug!("nca: header signature validated");
                SignatureStatus::Valid
            } else {
                warn!("nca: header signature is invalid");
                SignatureStatus::Invalid
            }
        } else {
            warn!(
                "nca: nca_hdr_fixed_key_modulus_{:02x} missing, signature not checked",
                header.signature_key_generation
            );
            SignatureStatus::Unchecked
        };

        debug!("nca: ready");
        Ok(Self {
            storage,
            len,
            header,
            partitions,
            keys: key_material,
            missing_key,
            signature,
            hash_cache_blocks: options.hash_cache_blocks,
        })
    }

    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.partitions
    }

    /// Section in header slot `index`.
    pub fn partition(&self, index: usize) -> Result<&PartitionEntry> {
        self.partitions
            .iter()
            .find(|p| p.header_index == index)
            .ok_or(Error::Parse("section not present"))
    }

    pub fn key_material(&self) -> &ContentKeyMaterial {
        &self.keys
    }

    pub fn signature_status(&self) -> SignatureStatus {
        self.signature
    }

    fn body_key(&self) -> Result<AesKey128> {
        self.keys
            .body_key
            .ok_or_else(|| Error::KeyUnavailable(self.missing_key.clone()))
    }

    /// Decrypted and, if the section is hashed, verified data of section
    /// `index`.
    pub fn open_section(&self, index: usize) -> Result<Box<dyn ReadSeek>> {
        let part = self.partition(index)?;
        let end = part.end()?;
        if end > self.len {
            return Err(Error::OutOfBounds {
                offset: end,
                size: self.len,
            });
        }
        let fs = &part.fs_header;
        let tree = fs.hash_tree()?;

        let mut keyed = KeyedRegionStream::new(self.storage.clone())?;
        match fs.encryption_type {
            EncryptionType::None => keyed.add_plaintext_region(part.offset, end)?,
            EncryptionType::AesCtr => keyed.add_region(
                part.offset,
                end,
                self.body_key()?,
                AesIv128::from_upper_iv(fs.upper_iv, part.offset),
            )?,
            EncryptionType::AesCtrSkipLayerHash => {
                add_skip_layer_hash_regions(&mut keyed, part, tree.as_ref(), self.body_key()?)?
            }
            _ => return Err(Error::UnsupportedEncryptionType(fs.raw_encryption_type())),
        }

        let mut section = SubStream::new(keyed, part.offset, part.size);
        let data: Box<dyn ReadSeek> = match &fs.compression {
            Some(info) => {
                let table = read_compression_table(&mut section, info)?;
                Box::new(CompressionOverlayStream::new(section, table)?)
            }
            None => Box::new(section),
        };
        match tree {
            Some(tree) => Ok(Box::new(HashTreeVerifyStream::with_cache(
                data,
                &tree,
                self.hash_cache_blocks,
            )?)),
            None => Ok(data),
        }
    }

    /// File listing and file streams of section `index`.
    pub fn open_filesystem(&self, index: usize) -> Result<FileSystemView> {
        let fs_type = self.partition(index)?.fs_header.fs_type;
        if let FsType::Unknown(raw) = fs_type {
            return Err(Error::UnsupportedFsType(raw));
        }

        let mut data = self.open_section(index)?;
        let files = match fs_type {
            FsType::PartitionFs => Pfs0::parse(&mut data)?.virtual_files()?,
            _ => RomFs::parse(&mut data)?.files,
        };
        debug!("nca: section {index} lists {} files", files.len());
        FileSystemView::new(data, files)
    }
}
