//! Block decompression helpers.
//!
//! NCA sections built with compaction store some of their blocks as raw LZ4
//! blocks (no frame, no size prefix). The decoded size is known from the
//! compression table, so decoders write into a caller-sized buffer.
//!
//! | Module | Algorithm | Used by |
//! |--------|-----------|---------|
//! | [`lz4`] | LZ4 block | [`crate::stream::CompressionOverlayStream`] |

pub mod lz4;
