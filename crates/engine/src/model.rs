//! The cluster model: connected peers and their repository file sets.
//!
//! Sits between the transport callbacks and the file sets. Incoming
//! indexes are folded into the right repository's set under the peer's
//! short index; block requests from peers are served from disk after an
//! availability check.

use crate::connection::{Connection, RequestError};
use blocksync_common::{ClusterError, PeerIndexMap, LOCAL_PEER};
use blocksync_fileset::FileSet;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct PoolInner<C: ?Sized> {
    index_map: PeerIndexMap,
    conns: HashMap<String, Arc<C>>,
}

/// Connected peers, addressable by long id or short index.
///
/// Shared between the model (which adds and removes peers) and the pull
/// scheduler (which picks peers against availability bitmaps).
pub struct ConnectionPool<C: ?Sized> {
    inner: Mutex<PoolInner<C>>,
}

impl<C: Connection + ?Sized> ConnectionPool<C> {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                index_map: PeerIndexMap::new(local_id),
                conns: HashMap::new(),
            }),
        }
    }

    /// Register a connection, assigning the peer a short index.
    pub fn add(&self, conn: Arc<C>) -> Result<u32, ClusterError> {
        let mut inner = self.lock();
        let index = inner.index_map.assign(conn.id())?;
        inner.conns.insert(conn.id().to_string(), conn);
        Ok(index)
    }

    /// Drop a connection, freeing its short index. Returns the index the
    /// peer held, so callers can clear its file set contributions.
    pub fn remove(&self, id: &str) -> Option<u32> {
        let mut inner = self.lock();
        let index = inner.index_map.index_of(id)?;
        inner.conns.remove(id);
        inner.index_map.clear(id);
        Some(index)
    }

    pub fn get(&self, id: &str) -> Option<Arc<C>> {
        self.lock().conns.get(id).cloned()
    }

    pub fn index_of(&self, id: &str) -> Option<u32> {
        self.lock().index_map.index_of(id)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().conns.contains_key(id)
    }

    /// Connected remote peers in index order: (index, id, connection).
    pub fn peers(&self) -> Vec<(u32, String, Arc<C>)> {
        let inner = self.lock();
        inner
            .index_map
            .iter()
            .filter(|(i, _)| *i != LOCAL_PEER)
            .filter_map(|(i, name)| {
                inner
                    .conns
                    .get(name)
                    .map(|c| (i, name.to_string(), c.clone()))
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<C>> {
        self.inner.lock().expect("connection pool lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

struct Repository {
    dir: PathBuf,
    fileset: Arc<FileSet>,
}

/// Per-node cluster state: one file set per repository plus the pool of
/// connected peers.
pub struct Model<C: ?Sized> {
    pool: Arc<ConnectionPool<C>>,
    repos: HashMap<String, Repository>,
}

impl<C: Connection + ?Sized> Model<C> {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(local_id)),
            repos: HashMap::new(),
        }
    }

    /// Register a repository before the model is shared.
    pub fn add_repository(
        &mut self,
        id: impl Into<String>,
        dir: impl Into<PathBuf>,
        fileset: Arc<FileSet>,
    ) {
        self.repos.insert(
            id.into(),
            Repository {
                dir: dir.into(),
                fileset,
            },
        );
    }

    pub fn pool(&self) -> Arc<ConnectionPool<C>> {
        self.pool.clone()
    }

    pub fn fileset(&self, repo: &str) -> Option<Arc<FileSet>> {
        self.repos.get(repo).map(|r| r.fileset.clone())
    }

    pub fn repo_dir(&self, repo: &str) -> Option<&Path> {
        self.repos.get(repo).map(|r| r.dir.as_path())
    }

    pub fn connected_to(&self, id: &str) -> bool {
        self.pool.is_connected(id)
    }

    /// A peer connected: register it and send it our current index for
    /// every repository.
    pub async fn peer_connected(&self, conn: Arc<C>) -> Result<u32, ClusterError> {
        let index = self.pool.add(conn.clone())?;
        tracing::info!(peer = conn.id(), index, "peer connected");
        for (repo, state) in &self.repos {
            let files = state.fileset.have(LOCAL_PEER);
            conn.index(repo, files).await;
        }
        Ok(index)
    }

    /// A peer disconnected: its contribution to every repository is
    /// withdrawn and its short index freed.
    pub fn peer_disconnected(&self, id: &str) {
        let Some(index) = self.pool.remove(id) else {
            return;
        };
        tracing::info!(peer = id, index, "peer disconnected");
        for state in self.repos.values() {
            state.fileset.replace(index, Vec::new());
        }
    }

    /// A peer delivered its full index for a repository.
    pub fn index_received(
        &self,
        peer: &str,
        repo: &str,
        files: Vec<blocksync_fileset::FileRecord>,
    ) {
        let Some(index) = self.pool.index_of(peer) else {
            tracing::warn!(peer, repo, "index from unknown peer");
            return;
        };
        let Some(state) = self.repos.get(repo) else {
            tracing::warn!(peer, repo, "index for unknown repository");
            return;
        };
        tracing::debug!(peer, repo, files = files.len(), "index received");
        blocksync_metrics::metrics().index_updates.inc();
        state.fileset.replace(index, files);
    }

    /// A peer delivered an incremental index update for a repository.
    pub fn index_update_received(
        &self,
        peer: &str,
        repo: &str,
        files: Vec<blocksync_fileset::FileRecord>,
    ) {
        let Some(index) = self.pool.index_of(peer) else {
            tracing::warn!(peer, repo, "index update from unknown peer");
            return;
        };
        let Some(state) = self.repos.get(repo) else {
            tracing::warn!(peer, repo, "index update for unknown repository");
            return;
        };
        tracing::debug!(peer, repo, files = files.len(), "index update received");
        blocksync_metrics::metrics().index_updates.inc();
        state.fileset.update(index, files);
    }

    /// Serve a block request from a peer. The file must be one the local
    /// node currently publishes (availability bit 0), and the read must
    /// return exactly `size` bytes.
    pub fn request(
        &self,
        repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, RequestError> {
        let state = self.repos.get(repo).ok_or(RequestError::Unavailable)?;
        if state.fileset.availability(name) & (1 << LOCAL_PEER) == 0 {
            return Err(RequestError::Unavailable);
        }
        let rel = sanitize_name(name).ok_or(RequestError::Unavailable)?;
        let path = state.dir.join(rel);

        use std::os::unix::fs::FileExt;
        let file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}

/// Reject request names that would escape the repository directory.
fn sanitize_name(name: &str) -> Option<&Path> {
    let path = Path::new(name);
    let clean = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if clean && !name.is_empty() {
        Some(path)
    } else {
        None
    }
}
