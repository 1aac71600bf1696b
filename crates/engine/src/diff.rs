//! The need planner: block-level diff between the wanted version of a
//! file and whatever the local node already has.

use blocksync_fileset::BlockInfo;
use std::collections::HashMap;

/// A wanted block whose content already exists in the local file, at
/// `local_offset`. Copying it avoids a remote fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub hash: [u8; 32],
    /// Offset of the block in the file being assembled.
    pub offset: u64,
    pub size: u32,
    /// Offset of the matching content in the current local file.
    pub local_offset: u64,
}

/// Result of diffing a wanted block list against the local one.
#[derive(Debug, Default, Clone)]
pub struct BlockDiff {
    /// Wanted blocks available locally, in file order.
    pub have: Vec<CopySource>,
    /// Wanted blocks that must be fetched, in file order.
    pub need: Vec<BlockInfo>,
}

/// Diff the wanted block list against the local one.
///
/// The match is by hash, not by position, so content that moved within
/// the file (or was duplicated) is still reused. Zero-size blocks are
/// never copy candidates.
pub fn block_diff(local: &[BlockInfo], target: &[BlockInfo]) -> BlockDiff {
    let mut by_hash: HashMap<&[u8; 32], u64> = HashMap::new();
    for b in local {
        if b.size > 0 {
            by_hash.entry(&b.hash).or_insert(b.offset);
        }
    }

    let mut diff = BlockDiff::default();
    for b in target {
        match by_hash.get(&b.hash) {
            Some(&local_offset) if b.size > 0 => diff.have.push(CopySource {
                hash: b.hash,
                offset: b.offset,
                size: b.size,
                local_offset,
            }),
            _ => diff.need.push(b.clone()),
        }
    }
    diff
}
