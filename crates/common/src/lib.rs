//! blocksync-common: shared types for the blocksync project.
//!
//! Provides the peer short-index map that translates long stable peer
//! identifiers into the compact indexes used by the file set's
//! availability bitmaps.

use std::fmt;

/// Number of peer slots in a cluster. Availability bitmaps are one
/// machine word wide, so this cannot grow without changing their
/// representation.
pub const MAX_PEERS: usize = 64;

/// The short index reserved for the local node.
pub const LOCAL_PEER: u32 = 0;

/// Assert that a peer index is within [0, 63].
///
/// Out-of-range indexes are a programmer error, not an operational
/// condition, and halt the calling task.
#[inline]
pub fn check_peer_index(peer: u32) {
    assert!(
        (peer as usize) < MAX_PEERS,
        "peer index must be in the range 0 - 63 inclusive, got {}",
        peer
    );
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster is full ({MAX_PEERS} peers)")]
    ClusterFull,
}

// ---------------------------------------------------------------------------
// PeerIndexMap
// ---------------------------------------------------------------------------

/// Bidirectional map between long stable peer ids and short indexes.
///
/// Index 0 is the local node and is assigned at construction. Cleared
/// slots are reused before the map grows. Indexes are valid within one
/// cluster epoch; a peer that disconnects and reconnects may receive a
/// different index.
#[derive(Clone)]
pub struct PeerIndexMap {
    // names[i] is the long id of peer i; an empty string marks a free slot.
    names: Vec<String>,
}

impl PeerIndexMap {
    /// Create a map with the local node occupying index 0.
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            names: vec![local_id.into()],
        }
    }

    /// The index of a known peer.
    pub fn index_of(&self, id: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| !n.is_empty() && n == id)
            .map(|i| i as u32)
    }

    /// The long id at an index, if the slot is occupied.
    pub fn name_of(&self, index: u32) -> Option<&str> {
        check_peer_index(index);
        match self.names.get(index as usize) {
            Some(n) if !n.is_empty() => Some(n),
            _ => None,
        }
    }

    /// Return the peer's index, assigning a new one if necessary.
    /// Freed slots are reused before the map grows.
    pub fn assign(&mut self, id: &str) -> Result<u32, ClusterError> {
        if let Some(i) = self.index_of(id) {
            return Ok(i);
        }
        // Reuse a cleared slot, skipping the local slot.
        for (i, name) in self.names.iter_mut().enumerate().skip(1) {
            if name.is_empty() {
                *name = id.to_string();
                return Ok(i as u32);
            }
        }
        if self.names.len() >= MAX_PEERS {
            return Err(ClusterError::ClusterFull);
        }
        self.names.push(id.to_string());
        Ok((self.names.len() - 1) as u32)
    }

    /// Free the peer's slot. The local slot is never cleared.
    pub fn clear(&mut self, id: &str) {
        if let Some(i) = self.index_of(id) {
            if i != LOCAL_PEER {
                self.names[i as usize].clear();
            }
        }
    }

    /// Occupied slots in index order. Iteration order is the
    /// deterministic tie-break for peer selection.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_empty())
            .map(|(i, n)| (i as u32, n.as_str()))
    }

    /// Number of occupied slots, local included.
    pub fn len(&self) -> usize {
        self.names.iter().filter(|n| !n.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        // The local slot is always occupied.
        false
    }
}

impl fmt::Debug for PeerIndexMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(i, n)| (i, n)))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
