//! Blockwise SHA-256 hashing of file content.

use crate::file::BlockInfo;
use sha2::{Digest, Sha256};
use std::io::{self, Read};

/// Block size used throughout the cluster. All peers must agree on it
/// for block-level reuse to work.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// SHA-256 of the empty input; the canonical single block of an empty file.
pub const EMPTY_BLOCK_HASH: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
    0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
    0xb8, 0x55,
];

/// Read up to `buf.len()` bytes, stopping only at EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Hash a reader blockwise. Returns the total size and the ordered block
/// list. An empty input yields one zero-size block with the canonical
/// empty digest, so every file has at least one block.
pub fn hash_blocks<R: Read>(mut r: R, block_size: usize) -> io::Result<(u64, Vec<BlockInfo>)> {
    let mut blocks = Vec::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; block_size];

    loop {
        let n = read_full(&mut r, &mut buf)?;
        if n == 0 {
            break;
        }
        let digest = Sha256::digest(&buf[..n]);
        blocks.push(BlockInfo {
            offset: size,
            size: n as u32,
            hash: digest.into(),
        });
        size += n as u64;
        if n < block_size {
            break;
        }
    }

    if blocks.is_empty() {
        blocks.push(BlockInfo {
            offset: 0,
            size: 0,
            hash: EMPTY_BLOCK_HASH,
        });
    }

    Ok((size, blocks))
}
