//! File records: the immutable per-version description of one file.

use crate::version::{VersionOrder, VersionVector};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The file has been deleted; the record is a tombstone.
pub const FLAG_DELETED: u32 = 1 << 12;
/// The file could not be read or hashed and must not be synchronized.
pub const FLAG_INVALID: u32 = 1 << 13;
/// Low bits carry the Unix permission bits.
pub const FLAG_MODE_MASK: u32 = 0o777;

/// One content block: `size` bytes at `offset`, with a SHA-256 digest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: [u8; 32],
}

impl fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block{{{}+{} {}}}",
            self.offset,
            self.size,
            hex::encode(&self.hash[..4])
        )
    }
}

/// A single version of a single file, as tracked by the file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// UTF-8 relative path within the repository.
    pub name: String,
    /// Bit field: `FLAG_DELETED`, `FLAG_INVALID`, Unix mode bits.
    pub flags: u32,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
    pub version: VersionVector,
    pub size: u64,
    /// Ordered content blocks. Empty for tombstones.
    pub blocks: Vec<BlockInfo>,
    /// Scanner marker: the local content changed and the version must be
    /// bumped before the record enters the file set. Never persisted.
    #[serde(skip)]
    pub changed: bool,
}

impl FileRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    /// Unix permission bits.
    pub fn mode(&self) -> u32 {
        self.flags & FLAG_MODE_MASK
    }

    /// Same name and a version vector comparing Equal.
    pub fn same_version(&self, other: &FileRecord) -> bool {
        self.name == other.name && self.version.compare(&other.version) == VersionOrder::Equal
    }

    pub fn newer_than(&self, other: &FileRecord) -> bool {
        self.version.newer_than(&other.version)
    }

    /// Derive the tombstone that propagates this file's deletion:
    /// Deleted flag, no blocks, size zero, version bumped at `peer_index`.
    pub fn tombstone(&self, peer_index: usize) -> FileRecord {
        FileRecord {
            name: self.name.clone(),
            flags: FLAG_DELETED,
            modified: self.modified,
            version: self.version.incremented(peer_index),
            size: 0,
            blocks: Vec::new(),
            changed: false,
        }
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "File{{name: {:?}, flags: 0o{:o}, modified: {}, version: {:?}, size: {}, blocks: {}}}",
            self.name,
            self.flags,
            self.modified,
            self.version.counters(),
            self.size,
            self.blocks.len()
        )
    }
}

/// The identity of one file version within a repository: (name, version).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub name: String,
    pub version: VersionVector,
}
