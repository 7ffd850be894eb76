//! Key management for Nintendo Switch cryptography.
//!
//! Nintendo Switch titles use a layered key derivation scheme:
//!
//! * **Master keys** (`master_key_XX`) are the root secrets obtained from
//!   the security processor. There is one per firmware generation.
//! * **Key area encryption keys** (KAEK) are derived per content type
//!   (Application / Ocean / System) from the master key.
//! * **Title KEKs** (`titlekek_XX`) unwrap the encrypted title keys of
//!   rights-id content.
//! * **Header key** decrypts the AES-XTS NCA header (0xC00 bytes).
//!
//! Keys that are missing from `prod.keys` but derivable from the master keys
//! and the key sources are filled in by [`KeySet::derive_keys`].
//!
//! ## Key file format
//! Nintendo key files are simple `name = hex_value` text files, one entry
//! per line, comments prefixed with `;`.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};

use log::{debug, warn};

use crate::crypto::AesKey128;
use crate::crypto::aes::ecb_decrypt;
use crate::{Error, Result};

/// Maximum number of master key generations understood by this library.
pub const MAX_KEY_GENERATION: usize = 32;

/// Size of an RSA-2048 modulus.
pub const RSA_2048_MODULUS_SIZE: usize = 0x100;

/// Key area encryption key index (determines which KAEK derivation chain is
/// used for a particular NCA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KaekIndex {
    /// Application content (most games).
    Application = 0,
    /// Ocean content (game-card specific).
    Ocean = 1,
    /// System content (OS modules).
    System = 2,
}

impl KaekIndex {
    const ALL: [(Self, &'static str); 3] = [
        (Self::Application, "application"),
        (Self::Ocean, "ocean"),
        (Self::System, "system"),
    ];
}

impl TryFrom<u8> for KaekIndex {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Application),
            1 => Ok(Self::Ocean),
            2 => Ok(Self::System),
            _ => Err(Error::Parse("invalid KAEK index")),
        }
    }
}

/// Source of decrypted body keys for rights-id content.
///
/// Implemented by [`KeySet`] over `title.keys`; a ticket store can implement
/// it as well.
pub trait TitleKeyResolver {
    /// Decrypted title key for `rights_id` at the given key revision.
    fn resolve_title_key(&self, rights_id: &[u8; 16], key_revision: u8) -> Option<AesKey128>;
}

/// `kek = D(master, kek_seed)`, `key = D(kek, source)`, then optionally
/// `D(key, key_seed)`.
pub fn generate_kek(
    source: &[u8; 16],
    master_key: &AesKey128,
    kek_seed: &[u8; 16],
    key_seed: Option<&[u8; 16]>,
) -> AesKey128 {
    let kek = AesKey128(ecb_decrypt(master_key, kek_seed));
    let src_kek = AesKey128(ecb_decrypt(&kek, source));
    match key_seed {
        Some(seed) => AesKey128(ecb_decrypt(&src_kek, seed)),
        None => src_kek,
    }
}

/// All keys needed to decrypt Switch content.
///
/// Fields that are absent are [`None`]; the NCA reader reports
/// [`Error::KeyUnavailable`] rather than producing garbage output.
#[derive(Default)]
pub struct KeySet {
    /// AES-XTS key pair (two 16-byte keys) used to decrypt NCA headers.
    pub header_key: Option<[u8; 32]>,

    /// Key area encryption keys, indexed by [`KaekIndex`] then by generation.
    pub kaek: [[Option<AesKey128>; MAX_KEY_GENERATION]; 3],

    /// Common title KEKs by key revision.
    pub titlekek: [Option<AesKey128>; MAX_KEY_GENERATION],

    pub master_keys: [Option<AesKey128>; MAX_KEY_GENERATION],

    pub header_kek_source: Option<[u8; 16]>,
    pub header_key_source: Option<[u8; 32]>,
    pub aes_kek_generation_source: Option<[u8; 16]>,
    pub aes_key_generation_source: Option<[u8; 16]>,
    pub titlekek_source: Option<[u8; 16]>,
    pub key_area_key_sources: [Option<[u8; 16]>; 3],

    /// Moduli of the fixed NCA header signing keys, by signature key
    /// generation.
    pub header_fixed_key_modulus: [Option<Box<[u8; RSA_2048_MODULUS_SIZE]>>; 2],

    /// Encrypted title keys by rights ID.
    pub title_keys: HashMap<[u8; 16], [u8; 16]>,
}

fn parse_hex<const N: usize>(value: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(value, &mut out).ok()?;
    Some(out)
}

/// Split `titlekek_0a` into `("titlekek", 10)`.
fn split_generation(name: &str) -> Option<(&str, usize)> {
    let (stem, index) = name.rsplit_once('_')?;
    if index.len() != 2 {
        return None;
    }
    let index = usize::from_str_radix(index, 16).ok()?;
    (index < MAX_KEY_GENERATION).then_some((stem, index))
}

fn key_lines<R: Read>(reader: R) -> impl Iterator<Item = Result<(String, String)>> {
    BufReader::new(reader).lines().filter_map(|line| {
        let line = match line {
            Ok(line) => line,
            Err(e) => return Some(Err(Error::Io(e))),
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return None;
        }
        let (name, value) = line.split_once('=')?;
        Some(Ok((name.trim().to_ascii_lowercase(), value.trim().to_owned())))
    })
}

impl KeySet {
    /// Create an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load keys from a `prod.keys`-style reader.
    ///
    /// Lines beginning with `;` and blank lines are ignored. Each valid line
    /// has the form `key_name = hexvalue`. Unknown key names are silently
    /// skipped so that the library remains forward-compatible; known names
    /// with a malformed value are skipped with a warning.
    pub fn load_prod_keys<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut loaded = 0usize;
        for entry in key_lines(reader) {
            let (name, value) = entry?;
            match self.set_key(&name, &value) {
                Some(true) => loaded += 1,
                Some(false) => warn!("ignoring malformed value for key {name}"),
                None => {}
            }
        }
        debug!("loaded {loaded} keys");
        Ok(())
    }

    /// Store one named key. `None` if the name is unknown, `Some(false)` if
    /// the value does not decode to the key's size.
    fn set_key(&mut self, name: &str, value: &str) -> Option<bool> {
        fn put<const N: usize>(slot: &mut Option<[u8; N]>, value: &str) -> bool {
            *slot = parse_hex(value);
            slot.is_some()
        }
        fn put_key(slot: &mut Option<AesKey128>, value: &str) -> bool {
            *slot = parse_hex(value).map(AesKey128);
            slot.is_some()
        }

        let stored = match name {
            "header_key" => put(&mut self.header_key, value),
            "header_kek_source" => put(&mut self.header_kek_source, value),
            "header_key_source" => put(&mut self.header_key_source, value),
            "aes_kek_generation_source" => put(&mut self.aes_kek_generation_source, value),
            "aes_key_generation_source" => put(&mut self.aes_key_generation_source, value),
            "titlekek_source" => put(&mut self.titlekek_source, value),
            _ => {
                if let Some(kind) = name
                    .strip_prefix("key_area_key_")
                    .and_then(|rest| rest.strip_suffix("_source"))
                {
                    let (index, _) = KaekIndex::ALL.iter().find(|(_, n)| *n == kind)?;
                    return Some(put(&mut self.key_area_key_sources[*index as usize], value));
                }

                let (stem, r#gen) = split_generation(name)?;
                match stem {
                    "master_key" => put_key(&mut self.master_keys[r#gen], value),
                    "titlekek" => put_key(&mut self.titlekek[r#gen], value),
                    "nca_hdr_fixed_key_modulus" => {
                        let slot = self.header_fixed_key_modulus.get_mut(r#gen)?;
                        *slot = parse_hex::<RSA_2048_MODULUS_SIZE>(value).map(Box::new);
                        slot.is_some()
                    }
                    _ => {
                        let kind = stem.strip_prefix("key_area_key_")?;
                        let (index, _) = KaekIndex::ALL.iter().find(|(_, n)| *n == kind)?;
                        put_key(&mut self.kaek[*index as usize][r#gen], value)
                    }
                }
            }
        };
        Some(stored)
    }

    /// Load title keys from a `title.keys`-style reader.
    ///
    /// Each line: `<32-hex-char rights_id> = <32-hex-char title_key>`.
    pub fn load_title_keys<R: Read>(&mut self, reader: R) -> Result<()> {
        for entry in key_lines(reader) {
            let (rights, key) = entry?;
            match (parse_hex::<16>(&rights), parse_hex::<16>(&key)) {
                (Some(r), Some(k)) => {
                    self.title_keys.insert(r, k);
                }
                _ => warn!("ignoring malformed title key entry {rights}"),
            }
        }
        debug!("loaded {} title keys", self.title_keys.len());
        Ok(())
    }

    /// Fill in missing KAEKs, title KEKs and the header key from the master
    /// keys and key sources. Keys already present are left untouched.
    pub fn derive_keys(&mut self) {
        for r#gen in 0..MAX_KEY_GENERATION {
            let Some(master) = self.master_keys[r#gen] else {
                continue;
            };

            if self.titlekek[r#gen].is_none()
                && let Some(source) = &self.titlekek_source
            {
                self.titlekek[r#gen] = Some(AesKey128(ecb_decrypt(&master, source)));
            }

            if let Some(kek_seed) = &self.aes_kek_generation_source {
                for (index, source) in self.key_area_key_sources.iter().enumerate() {
                    let Some(source) = source else { continue };
                    let slot = &mut self.kaek[index][r#gen];
                    if slot.is_none() {
                        *slot = Some(generate_kek(
                            source,
                            &master,
                            kek_seed,
                            self.aes_key_generation_source.as_ref(),
                        ));
                    }
                }
            }
        }

        if self.header_key.is_none()
            && let (Some(master), Some(kek_source), Some(key_source), Some(kek_seed)) = (
                &self.master_keys[0],
                &self.header_kek_source,
                &self.header_key_source,
                &self.aes_kek_generation_source,
            )
        {
            let kek = generate_kek(
                kek_source,
                master,
                kek_seed,
                self.aes_key_generation_source.as_ref(),
            );
            let mut key = [0u8; 32];
            for (out, block) in key.chunks_exact_mut(16).zip(key_source.chunks_exact(16)) {
                let mut b = [0u8; 16];
                b.copy_from_slice(block);
                out.copy_from_slice(&ecb_decrypt(&kek, &b));
            }
            self.header_key = Some(key);
            debug!("derived header key");
        }
    }

    /// Look up the KAEK for the given index and firmware generation.
    pub fn get_kaek(&self, index: KaekIndex, generation: u8) -> Option<&AesKey128> {
        self.kaek[index as usize]
            .get(generation as usize)?
            .as_ref()
    }

    pub fn get_titlekek(&self, key_revision: u8) -> Option<&AesKey128> {
        self.titlekek.get(key_revision as usize)?.as_ref()
    }

    pub fn get_header_modulus(&self, generation: u8) -> Option<&[u8; RSA_2048_MODULUS_SIZE]> {
        self.header_fixed_key_modulus
            .get(generation as usize)?
            .as_deref()
    }

    /// Look up an encrypted title key by rights ID.
    pub fn get_title_key(&self, rights_id: &[u8; 16]) -> Option<&[u8; 16]> {
        self.title_keys.get(rights_id)
    }
}

impl TitleKeyResolver for KeySet {
    fn resolve_title_key(&self, rights_id: &[u8; 16], key_revision: u8) -> Option<AesKey128> {
        let encrypted = self.get_title_key(rights_id)?;
        let Some(kek) = self.get_titlekek(key_revision) else {
            warn!("title key found but titlekek_{key_revision:02x} is missing");
            return None;
        };
        Some(AesKey128(ecb_decrypt(kek, encrypted)))
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn count(slots: &[Option<AesKey128>]) -> usize {
            slots.iter().flatten().count()
        }
        f.debug_struct("KeySet")
            .field("header_key", &self.header_key.is_some())
            .field("master_keys", &count(&self.master_keys))
            .field("titlekek", &count(&self.titlekek))
            .field("kaek", &self.kaek.iter().map(|k| count(k)).collect::<Vec<_>>())
            .field("title_keys", &self.title_keys.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes::ecb_encrypt;

    fn key(byte: u8) -> AesKey128 {
        AesKey128([byte; 16])
    }

    #[test]
    fn prod_keys_are_parsed_by_name() {
        let text = "\
; comment
header_key = 00112233445566778899aabbccddeeff00112233445566778899AABBCCDDEEFF
master_key_00 = 01010101010101010101010101010101
titlekek_0a = 02020202020202020202020202020202
key_area_key_ocean_01 = 03030303030303030303030303030303
key_area_key_system_source = 04040404040404040404040404040404
some_future_key = 05
bogus line
";
        let mut keys = KeySet::new();
        keys.load_prod_keys(text.as_bytes()).unwrap();
        assert_eq!(keys.header_key.unwrap()[31], 0xff);
        assert_eq!(keys.master_keys[0], Some(key(1)));
        assert_eq!(keys.get_titlekek(10), Some(&key(2)));
        assert_eq!(keys.get_kaek(KaekIndex::Ocean, 1), Some(&key(3)));
        assert_eq!(keys.get_kaek(KaekIndex::Ocean, 0), None);
        assert_eq!(keys.key_area_key_sources[2], Some([4; 16]));
        assert_eq!(keys.get_kaek(KaekIndex::System, 200), None);
    }

    #[test]
    fn malformed_values_are_skipped() {
        let text = "master_key_00 = 0101\ntitlekek_00 = zz020202020202020202020202020202\n";
        let mut keys = KeySet::new();
        keys.load_prod_keys(text.as_bytes()).unwrap();
        assert!(keys.master_keys[0].is_none());
        assert!(keys.titlekek[0].is_none());
    }

    #[test]
    fn header_modulus_is_loaded() {
        let text = format!("nca_hdr_fixed_key_modulus_01 = {}\n", "ab".repeat(0x100));
        let mut keys = KeySet::new();
        keys.load_prod_keys(text.as_bytes()).unwrap();
        assert!(keys.get_header_modulus(0).is_none());
        assert_eq!(keys.get_header_modulus(1).unwrap()[0x80], 0xab);
    }

    #[test]
    fn derivation_matches_manual_chain() {
        let mut keys = KeySet::new();
        keys.master_keys[3] = Some(key(0x33));
        keys.titlekek_source = Some([0x11; 16]);
        keys.aes_kek_generation_source = Some([0x22; 16]);
        keys.aes_key_generation_source = Some([0x44; 16]);
        keys.key_area_key_sources[0] = Some([0x55; 16]);
        keys.derive_keys();

        let master = key(0x33);
        assert_eq!(
            keys.get_titlekek(3),
            Some(&AesKey128(ecb_decrypt(&master, &[0x11; 16])))
        );
        let kek = AesKey128(ecb_decrypt(&master, &[0x22; 16]));
        let src = AesKey128(ecb_decrypt(&kek, &[0x55; 16]));
        let expected = AesKey128(ecb_decrypt(&src, &[0x44; 16]));
        assert_eq!(keys.get_kaek(KaekIndex::Application, 3), Some(&expected));
        assert_eq!(keys.get_kaek(KaekIndex::Ocean, 3), None);
        assert!(keys.header_key.is_none());
    }

    #[test]
    fn derivation_keeps_loaded_keys() {
        let mut keys = KeySet::new();
        keys.master_keys[0] = Some(key(1));
        keys.titlekek[0] = Some(key(9));
        keys.titlekek_source = Some([0x11; 16]);
        keys.derive_keys();
        assert_eq!(keys.get_titlekek(0), Some(&key(9)));
    }

    #[test]
    fn title_keys_resolve_through_titlekek() {
        let rights = [0xaa; 16];
        let body = key(0x77);
        let kek = key(0x12);
        let text = format!(
            "{} = {}\n",
            hex::encode(rights),
            hex::encode(ecb_encrypt(&kek, body.as_bytes()))
        );

        let mut keys = KeySet::new();
        keys.load_title_keys(text.as_bytes()).unwrap();
        assert_eq!(keys.resolve_title_key(&rights, 2), None);
        keys.titlekek[2] = Some(kek);
        assert_eq!(keys.resolve_title_key(&rights, 2), Some(body));
        assert_eq!(keys.resolve_title_key(&[0; 16], 2), None);
    }

    #[test]
    fn debug_output_hides_keys() {
        let mut keys = KeySet::new();
        keys.header_key = Some([0xab; 32]);
        keys.master_keys[0] = Some(key(0xcd));
        let shown = format!("{keys:?}");
        assert!(!shown.contains("abab"));
        assert!(!shown.contains("cdcd"));
        assert!(shown.contains("header_key: true"));
    }
}
