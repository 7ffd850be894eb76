//! Cryptographic primitives for Nintendo Switch content.
//!
//! Everything here is stateless beyond the key and IV the caller passes in.
//! Key loading and derivation live in [`crate::keys::KeySet`]; the
//! stream layers in [`crate::stream`] build on these functions.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`aes`] | AES-128 ECB / CBC / CTR and the 32-bit-limb counter arithmetic |
//! | [`xts`] | AES-128-XTS sectors with Nintendo's big-endian sector tweak |
//!
//! ## Key hierarchy (brief)
//!
//! ```text
//! prod.keys
//!   └── header_key (32 bytes)
//!         ├── key1 (bytes  0–15)  ─┐  AES-XTS decrypt NCA header
//!         └── key2 (bytes 16–31)  ─┘
//!
//!   └── key_area_key_{application,ocean,system}_XX (16 bytes each)
//!         └── AES-ECB unwrap the key area in the NCA header
//!               └── body key → AES-CTR decrypt section data
//!
//!   └── titlekek_XX (16 bytes each)
//!         └── AES-ECB unwrap an encrypted title key (rights-id content)
//! ```

pub mod aes;
pub mod xts;

pub use self::aes::{AesIv128, AesKey128};
pub use self::xts::XtsCipher;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 0x10;

/// Size of a SHA-256 digest.
pub const SHA256_SIZE: usize = 0x20;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}
