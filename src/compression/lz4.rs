//! Raw LZ4 block decoding.
//!
//! The compressed data is a bare LZ4 block, as produced by
//! [`lz4_flex::block::compress`]. There is no size prefix; the caller
//! supplies an output buffer at least as large as the decoded block.

/// Decode one LZ4 block into `dst`, returning the number of bytes written.
///
/// Returns `None` if the block is malformed, does not fit into `dst`, or
/// decodes to zero bytes.
pub fn decompress_block(src: &[u8], dst: &mut [u8]) -> Option<usize> {
    match lz4_flex::block::decompress_into(src, dst) {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_into_larger_buffer() {
        let plain: Vec<u8> = b"abcabcabcabc".repeat(40);
        let packed = lz4_flex::block::compress(&plain);
        let mut out = vec![0u8; plain.len() + 32];
        assert_eq!(decompress_block(&packed, &mut out), Some(plain.len()));
        assert_eq!(&out[..plain.len()], &plain[..]);
    }

    #[test]
    fn rejects_garbage_and_small_buffers() {
        let plain = vec![7u8; 0x400];
        let packed = lz4_flex::block::compress(&plain);
        let mut small = vec![0u8; 0x100];
        assert_eq!(decompress_block(&packed, &mut small), None);
        assert_eq!(decompress_block(&[0xff, 0xff, 0xff], &mut small), None);
    }

    #[test]
    fn empty_block_is_a_failure() {
        let packed = lz4_flex::block::compress(&[]);
        let mut out = vec![0u8; 0x10];
        assert_eq!(decompress_block(&packed, &mut out), None);
    }
}
