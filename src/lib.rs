//! **ncakit** - decryption and hash-tree verification for Nintendo Content
//! Archives.
//!
//! Open an NCA with a [`keys::KeySet`], then list and read the files of any
//! of its sections:
//!
//! ```no_run
//! use std::fs::File;
//! use ncakit::formats::nca::{Nca, NcaOptions};
//! use ncakit::keys::KeySet;
//!
//! # fn main() -> ncakit::Result<()> {
//! let mut keys = KeySet::new();
//! keys.load_prod_keys(File::open("prod.keys")?)?;
//! keys.derive_keys();
//!
//! let nca = Nca::open(File::open("program.nca")?, &keys, &NcaOptions::default())?;
//! let exefs = nca.open_filesystem(0)?;
//! for file in exefs.files() {
//!     println!("{} ({:#x} bytes)", file.path, file.size);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//! | Module | Contents |
//! |--------|----------|
//! | [`crypto`]      | AES-128 ECB / CBC / CTR / XTS primitives |
//! | [`keys`]        | `prod.keys` / `title.keys` loading and key derivation |
//! | [`stream`]      | Keyed CTR regions, hash-tree verification, compression overlay |
//! | [`formats::nca`]   | NCA header, FS headers, section assembly |
//! | [`formats::pfs0`]  | PFS0 - PartitionFS flat archive |
//! | [`formats::romfs`] | RomFS - hierarchical data filesystem |
//! | [`vfs`]         | File listing and per-file streams of a section |

pub mod compression;
pub mod crypto;
pub mod error;
pub mod formats;
pub mod keys;
pub mod stream;
pub mod utils;
pub mod vfs;

pub use error::{Error, Result};
