//! The per-repository cluster file index.
//!
//! Tracks which file versions exist at the local node (peer 0) and at
//! each connected peer, maintains the global view (the newest version of
//! every name and which peers publish it), and answers the `need` query
//! the pull scheduler plans from.
//!
//! All operations take the one per-set lock for their full duration and
//! never suspend while holding it. Readers get snapshots they can
//! iterate without the lock.

use crate::file::{FileRecord, Fingerprint};
use crate::store::BlockStore;
use crate::version::VersionOrder;
use blocksync_common::{check_peer_index, MAX_PEERS};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

struct GlobalEntry {
    fp: Fingerprint,
    /// Bit i set: peer i's map holds exactly this fingerprint.
    availability: u64,
}

struct Inner {
    /// Current cluster vector width. Grows when a wider vector is seen,
    /// never shrinks; all stored vectors share this width.
    width: usize,
    store: BlockStore,
    peer_maps: Vec<HashMap<String, Fingerprint>>,
    changes: Vec<u64>,
    global: HashMap<String, GlobalEntry>,
}

/// The cluster file index for one repository.
pub struct FileSet {
    inner: Mutex<Inner>,
}

impl Default for FileSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                width: 0,
                store: BlockStore::new(),
                peer_maps: (0..MAX_PEERS).map(|_| HashMap::new()).collect(),
                changes: vec![0; MAX_PEERS],
                global: HashMap::new(),
            }),
        }
    }

    /// Replace the peer's entire map. A replacement identical to the
    /// current map (same name to fingerprint mapping) is a no-op and
    /// does not bump the change counter.
    pub fn replace(&self, peer: u32, mut files: Vec<FileRecord>) {
        check_peer_index(peer);
        let mut inner = self.lock();
        inner.normalize(peer, &mut files, 0);
        tracing::debug!(peer, files = files.len(), "replace");
        if !inner.map_equals(peer, &files) {
            inner.changes[peer as usize] += 1;
            inner.apply_replace(peer, files);
        }
    }

    /// Like [`replace`](Self::replace), synthesizing tombstones for names
    /// present in the peer's previous map but absent from `files`. Used
    /// for the local peer after a filesystem walk, where absence means
    /// deletion.
    pub fn replace_with_delete(&self, peer: u32, mut files: Vec<FileRecord>) {
        check_peer_index(peer);
        let mut inner = self.lock();
        // Tombstone synthesis bumps at this peer's index, so the width
        // must cover it even if no incoming record does.
        inner.normalize(peer, &mut files, peer as usize + 1);
        inner.synthesize_deletes(peer, &mut files);
        tracing::debug!(peer, files = files.len(), "replace_with_delete");
        if !inner.map_equals(peer, &files) {
            inner.changes[peer as usize] += 1;
            inner.apply_replace(peer, files);
        }
    }

    /// Per-file upsert. Records whose fingerprint matches the peer's
    /// existing entry are skipped; the change counter bumps only if
    /// something was applied.
    pub fn update(&self, peer: u32, mut files: Vec<FileRecord>) {
        check_peer_index(peer);
        let mut inner = self.lock();
        inner.normalize(peer, &mut files, 0);
        tracing::debug!(peer, files = files.len(), "update");
        if inner.apply_update(peer, files) > 0 {
            inner.changes[peer as usize] += 1;
        }
    }

    /// Files for which the global view holds a version strictly newer
    /// than the peer's own. An absent entry compares as older than
    /// anything, so the file is needed.
    pub fn need(&self, peer: u32) -> Vec<FileRecord> {
        check_peer_index(peer);
        let inner = self.lock();
        let mut out = Vec::new();
        for (name, g) in &inner.global {
            let needed = match inner.peer_maps[peer as usize].get(name) {
                Some(have) => g.fp.version.newer_than(&have.version),
                None => true,
            };
            if needed {
                if let Some(rec) = inner.store.get(&g.fp) {
                    out.push(rec.clone());
                }
            }
        }
        out
    }

    /// All records in the peer's map.
    pub fn have(&self, peer: u32) -> Vec<FileRecord> {
        check_peer_index(peer);
        let inner = self.lock();
        inner.peer_maps[peer as usize]
            .values()
            .filter_map(|fp| inner.store.get(fp).cloned())
            .collect()
    }

    /// All records in the global view.
    pub fn global(&self) -> Vec<FileRecord> {
        let inner = self.lock();
        inner
            .global
            .values()
            .filter_map(|g| inner.store.get(&g.fp).cloned())
            .collect()
    }

    pub fn get(&self, peer: u32, name: &str) -> Option<FileRecord> {
        check_peer_index(peer);
        let inner = self.lock();
        let fp = inner.peer_maps[peer as usize].get(name)?;
        inner.store.get(fp).cloned()
    }

    pub fn get_global(&self, name: &str) -> Option<FileRecord> {
        let inner = self.lock();
        let g = inner.global.get(name)?;
        inner.store.get(&g.fp).cloned()
    }

    /// Availability bitmap for a name; zero when the global view has no
    /// entry for it.
    pub fn availability(&self, name: &str) -> u64 {
        let inner = self.lock();
        inner.global.get(name).map(|g| g.availability).unwrap_or(0)
    }

    /// Monotonic per-peer mutation counter for downstream cache
    /// invalidation.
    pub fn changes(&self, peer: u32) -> u64 {
        check_peer_index(peer);
        self.lock().changes[peer as usize]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a mutator panicked mid-operation; the
        // index is unrecoverable at that point.
        self.inner.lock().expect("file set lock poisoned")
    }
}

impl Inner {
    /// Bring incoming records to the common vector width and apply the
    /// scanner's changed marker (bump at the target peer's index, clear
    /// the flag) before anything is compared or stored.
    fn normalize(&mut self, peer: u32, files: &mut [FileRecord], min_width: usize) {
        let mut width = self
            .width
            .max(min_width)
            .max(files.iter().map(|f| f.version.len()).max().unwrap_or(0));
        if files.iter().any(|f| f.changed) {
            width = width.max(peer as usize + 1);
        }
        if width > self.width {
            self.grow_width(width);
        }
        for f in files.iter_mut() {
            f.version.pad_to(self.width);
            if f.changed {
                f.version.increment(peer as usize);
                f.changed = false;
            }
        }
    }

    fn grow_width(&mut self, width: usize) {
        self.width = width;
        self.store.grow_width(width);
        for map in &mut self.peer_maps {
            for fp in map.values_mut() {
                fp.version.pad_to(width);
            }
        }
        for g in self.global.values_mut() {
            g.fp.version.pad_to(width);
        }
    }

    fn map_equals(&self, peer: u32, files: &[FileRecord]) -> bool {
        let map = &self.peer_maps[peer as usize];
        if map.len() != files.len() {
            return false;
        }
        files.iter().all(|f| map.get(&f.name) == Some(&f.fingerprint()))
    }

    /// Append carried-forward or freshly-bumped tombstones for every name
    /// in the peer's map that the new listing no longer contains. Names
    /// already deleted are carried unchanged, so repeated rescans do not
    /// spin the version.
    fn synthesize_deletes(&mut self, peer: u32, files: &mut Vec<FileRecord>) {
        let present: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
        let mut extra = Vec::new();
        for fp in self.peer_maps[peer as usize].values() {
            if present.contains(fp.name.as_str()) {
                continue;
            }
            if let Some(existing) = self.store.get(fp) {
                if existing.is_deleted() {
                    extra.push(existing.clone());
                } else {
                    tracing::debug!(peer, name = %fp.name, "deleted");
                    extra.push(existing.tombstone(peer as usize));
                }
            }
        }
        files.extend(extra);
    }

    fn apply_replace(&mut self, peer: u32, files: Vec<FileRecord>) {
        // Drop this peer's references, then rebuild the global view from
        // the remaining 63 maps before folding the new files in.
        let old_map = std::mem::take(&mut self.peer_maps[peer as usize]);
        for fp in old_map.values() {
            self.store.release(fp);
        }
        self.recompute_global();
        self.apply_update(peer, files);
    }

    /// Rebuild every global entry as the peer-wise maximum among the
    /// current maps. Conflicting candidates contribute availability only
    /// when they compare Equal to the winner; the entry disappears when
    /// no peer holds the name.
    fn recompute_global(&mut self) {
        let names: Vec<String> = self.global.keys().cloned().collect();
        for name in names {
            self.recompute_name(&name);
        }
    }

    fn recompute_name(&mut self, name: &str) {
        let mut winner: Option<(Fingerprint, u64)> = None;
        for (i, map) in self.peer_maps.iter().enumerate() {
            let Some(fp) = map.get(name) else { continue };
            match &mut winner {
                None => winner = Some((fp.clone(), 1 << i)),
                Some((wfp, avail)) => match fp.version.compare(&wfp.version) {
                    VersionOrder::Equal => *avail |= 1 << i,
                    VersionOrder::Greater => {
                        *wfp = fp.clone();
                        *avail = 1 << i;
                    }
                    VersionOrder::Lesser | VersionOrder::Conflicting => {}
                },
            }
        }
        let Some(old) = self.global.remove(name) else {
            return;
        };
        match winner {
            Some((fp, availability)) => {
                if fp != old.fp {
                    self.store.add_ref(&fp);
                    self.store.release(&old.fp);
                }
                self.global
                    .insert(name.to_string(), GlobalEntry { fp, availability });
            }
            None => self.store.release(&old.fp),
        }
    }

    /// Upsert records into the peer's map and fold them into the global
    /// view. Returns how many records were actually applied.
    fn apply_update(&mut self, peer: u32, files: Vec<FileRecord>) -> usize {
        let bit = 1u64 << peer;
        let mut applied = 0;
        for f in files {
            let fp = f.fingerprint();
            let map = &mut self.peer_maps[peer as usize];
            if map.get(&f.name) == Some(&fp) {
                // The peer already has exactly this version.
                continue;
            }
            if let Some(old) = map.insert(f.name.clone(), fp.clone()) {
                self.store.release(&old);
            }
            let name = f.name.clone();
            let version = f.version.clone();
            self.store.insert(f);
            applied += 1;

            let mut drained = false;
            match self.global.get_mut(&name) {
                Some(g) if g.fp == fp => {
                    g.availability |= bit;
                }
                Some(g) => match version.compare(&g.fp.version) {
                    // A strictly newer version takes the entry over; so
                    // does a Conflicting one (last insert wins, reported
                    // through divergent per-peer views rather than as an
                    // error).
                    VersionOrder::Greater | VersionOrder::Conflicting => {
                        let old_fp = std::mem::replace(&mut g.fp, fp.clone());
                        g.availability = bit;
                        self.store.add_ref(&fp);
                        self.store.release(&old_fp);
                    }
                    VersionOrder::Lesser | VersionOrder::Equal => {
                        // The peer moved off the global version; its
                        // availability claim no longer holds.
                        if g.availability & bit != 0 {
                            g.availability &= !bit;
                            drained = g.availability == 0;
                        }
                    }
                },
                None => {
                    self.store.add_ref(&fp);
                    self.global.insert(
                        name.clone(),
                        GlobalEntry {
                            fp,
                            availability: bit,
                        },
                    );
                }
            }
            if drained {
                self.recompute_name(&name);
            }
        }
        applied
    }
}
