//! Parsers for the NCA container and the filesystems it carries.
//!
//! All parsers follow the same conventions:
//!
//! * **Generic over** [`std::io::Read`] + [`std::io::Seek`] - pass a [`std::fs::File`], a
//!   [`std::io::Cursor`], a section stream from [`nca::Nca::open_section`], or
//!   anything else that implements both traits.
//! * **Metadata only** - the `parse` method reads headers and builds an
//!   in-memory description of the archive's contents. File data is never
//!   eagerly loaded; [`crate::vfs::FileSystemView`] streams it on demand.
//!
//! ## Format overview
//!
//! | Module    | Format      | Description |
//! |-----------|-------------|-------------|
//! | [`nca`]   | NCA         | Encrypted content container; holds program, meta, control, and data content |
//! | [`pfs0`]  | PFS0        | Flat archive; NCA ExeFS/Logo sections |
//! | [`romfs`] | RomFS       | Directory tree; NCA data sections |

pub mod nca;
pub mod pfs0;
pub mod romfs;
