//! End-to-end pull scheduler tests against an in-memory fake peer.

use async_trait::async_trait;
use blocksync_common::LOCAL_PEER;
use blocksync_engine::chaos::{ChaosConfig, ChaosConnection};
use blocksync_engine::{Connection, ConnectionPool, PullConfig, Puller, RequestError, Statistics};
use blocksync_fileset::blocks::hash_blocks;
use blocksync_fileset::{FileRecord, FileSet, VersionVector, FLAG_DELETED};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tempfile::TempDir;

const BS: usize = 16;

// ---------------------------------------------------------------------------
// Fake peer
// ---------------------------------------------------------------------------

struct FakePeer {
    id: String,
    files: RwLock<HashMap<String, Vec<u8>>>,
    delay: Duration,
    corrupt: AtomicBool,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakePeer {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            files: RwLock::new(HashMap::new()),
            delay: Duration::ZERO,
            corrupt: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn add_file(&self, name: &str, data: &[u8]) {
        self.files
            .write()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
    }
}

#[async_trait]
impl Connection for FakePeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn index(&self, _repo: &str, _files: Vec<FileRecord>) {}

    async fn request(
        &self,
        _repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, RequestError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let files = self.files.read().unwrap();
        let data = files
            .get(name)
            .ok_or_else(|| RequestError::Remote("no such file".into()))?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > data.len() {
            return Err(RequestError::Remote("read past end of file".into()));
        }
        let mut chunk = data[start..end].to_vec();
        if self.corrupt.load(Ordering::SeqCst) {
            for b in &mut chunk {
                *b ^= 0xff;
            }
        }
        Ok(chunk)
    }

    fn statistics(&self) -> Statistics {
        Statistics::default()
    }

    fn option(&self, _key: &str) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn record(name: &str, data: &[u8], version: &[i64]) -> FileRecord {
    let (size, blocks) = hash_blocks(Cursor::new(data.to_vec()), BS).unwrap();
    FileRecord {
        name: name.to_string(),
        flags: 0o644,
        modified: 1_700_000_000,
        version: VersionVector::from_counters(version.to_vec()),
        size,
        blocks,
        changed: false,
    }
}

fn tombstone(name: &str, version: &[i64]) -> FileRecord {
    FileRecord {
        name: name.to_string(),
        flags: FLAG_DELETED,
        modified: 1_700_000_000,
        version: VersionVector::from_counters(version.to_vec()),
        size: 0,
        blocks: Vec::new(),
        changed: false,
    }
}

fn test_config() -> PullConfig {
    PullConfig {
        slots: 4,
        block_size: BS,
        need_interval: Duration::from_millis(30),
        rescan_interval: Duration::from_secs(3600),
        allow_delete: true,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// n distinct 16-byte blocks.
fn content(tags: &[u8]) -> Vec<u8> {
    tags.iter().flat_map(|t| vec![*t; BS]).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pull_copy_fetch_mix() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    // Local file holds blocks [1, 2, 3]; the wanted version is [2, 4, 1].
    let local_data = content(&[1, 2, 3]);
    let target_data = content(&[2, 4, 1]);
    std::fs::write(dir.path().join("f"), &local_data).unwrap();
    fileset.replace(LOCAL_PEER, vec![record("f", &local_data, &[1, 0])]);

    let peer = Arc::new(FakePeer::new("peer-1"));
    peer.add_file("f", &target_data);
    let target = record("f", &target_data, &[2, 0]);
    let pool = Arc::new(ConnectionPool::new("local"));
    assert_eq!(pool.add(peer.clone()).unwrap(), 1);
    fileset.replace(1, vec![target.clone()]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    wait_until("pulled file published", || {
        fileset
            .get(LOCAL_PEER, "f")
            .map(|f| f.same_version(&target))
            .unwrap_or(false)
    })
    .await;

    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), target_data);
    // Blocks 2 and 1 were copied in place; only block 4 went remote.
    assert_eq!(peer.requests.load(Ordering::SeqCst), 1);

    // Attributes applied before the rename.
    let meta = std::fs::metadata(dir.path().join("f")).unwrap();
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(meta.permissions().mode() & 0o777, 0o644);

    handle.stop().await;
}

#[tokio::test]
async fn test_slot_bound_two_files() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let data_a = content(&[1, 2, 3]);
    let data_b = content(&[4, 5, 6]);
    let peer = Arc::new(FakePeer::new("peer-1").with_delay(Duration::from_millis(25)));
    peer.add_file("a", &data_a);
    peer.add_file("b", &data_b);
    let rec_a = record("a", &data_a, &[1, 0]);
    let rec_b = record("b", &data_b, &[1, 0]);

    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(peer.clone()).unwrap();
    fileset.replace(1, vec![rec_a.clone(), rec_b.clone()]);

    let config = PullConfig {
        slots: 2,
        ..test_config()
    };
    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, config).start();

    wait_until("both files published", || {
        fileset.get(LOCAL_PEER, "a").is_some() && fileset.get(LOCAL_PEER, "b").is_some()
    })
    .await;

    assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), data_a);
    assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), data_b);
    assert_eq!(peer.requests.load(Ordering::SeqCst), 6);
    assert!(
        peer.max_in_flight.load(Ordering::SeqCst) <= 2,
        "slot bound violated: {} requests in flight",
        peer.max_in_flight.load(Ordering::SeqCst)
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_hash_mismatch_is_discarded() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let data = content(&[1, 2]);
    let peer = Arc::new(FakePeer::new("peer-1"));
    peer.add_file("f", &data);
    peer.corrupt.store(true, Ordering::SeqCst);

    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(peer.clone()).unwrap();
    fileset.replace(1, vec![record("f", &data, &[1, 0])]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    // Give the scheduler several need cycles to (repeatedly) fail.
    wait_until("corrupt peer was asked at least twice", || {
        peer.requests.load(Ordering::SeqCst) >= 4
    })
    .await;

    assert!(!dir.path().join("f").exists(), "corrupt pull must not publish");
    assert!(fileset.get(LOCAL_PEER, "f").is_none());

    handle.stop().await;
}

#[tokio::test]
async fn test_delete_propagation() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let data = content(&[9]);
    std::fs::write(dir.path().join("doomed"), &data).unwrap();
    fileset.replace(LOCAL_PEER, vec![record("doomed", &data, &[1, 0])]);

    let peer = Arc::new(FakePeer::new("peer-1"));
    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(peer).unwrap();
    fileset.replace(1, vec![tombstone("doomed", &[2, 0])]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    wait_until("deletion applied", || {
        fileset
            .get(LOCAL_PEER, "doomed")
            .map(|f| f.is_deleted())
            .unwrap_or(false)
    })
    .await;
    assert!(!dir.path().join("doomed").exists());

    handle.stop().await;
}

#[tokio::test]
async fn test_deletes_ignored_when_disallowed() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let data = content(&[9]);
    std::fs::write(dir.path().join("kept"), &data).unwrap();
    fileset.replace(LOCAL_PEER, vec![record("kept", &data, &[1, 0])]);

    let peer = Arc::new(FakePeer::new("peer-1"));
    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(peer).unwrap();
    fileset.replace(1, vec![tombstone("kept", &[2, 0])]);

    let config = PullConfig {
        allow_delete: false,
        ..test_config()
    };
    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, config).start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dir.path().join("kept").exists());
    assert!(!fileset.get(LOCAL_PEER, "kept").unwrap().is_deleted());

    handle.stop().await;
}

#[tokio::test]
async fn test_empty_file_needs_no_requests() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let peer = Arc::new(FakePeer::new("peer-1"));
    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(peer.clone()).unwrap();
    let empty = record("empty.txt", b"", &[1, 0]);
    fileset.replace(1, vec![empty.clone()]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    wait_until("empty file published", || {
        fileset
            .get(LOCAL_PEER, "empty.txt")
            .map(|f| f.same_version(&empty))
            .unwrap_or(false)
    })
    .await;

    let meta = std::fs::metadata(dir.path().join("empty.txt")).unwrap();
    assert_eq!(meta.len(), 0);
    assert_eq!(peer.requests.load(Ordering::SeqCst), 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_no_available_peer_abandons_file() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    // The index for peer 1 arrived, but the connection is gone.
    let data = content(&[1]);
    let pool: Arc<ConnectionPool<FakePeer>> = Arc::new(ConnectionPool::new("local"));
    fileset.replace(1, vec![record("f", &data, &[1, 0])]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!dir.path().join("f").exists());
    assert!(fileset.get(LOCAL_PEER, "f").is_none());

    handle.stop().await;
}

#[tokio::test]
async fn test_chaos_peer_recovers() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let data = content(&[1, 2, 3]);
    let inner = FakePeer::new("peer-1");
    inner.add_file("f", &data);
    let chaos = Arc::new(ChaosConnection::new(
        inner,
        ChaosConfig {
            failure_rate: 1.0,
            ..Default::default()
        },
    ));

    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(chaos.clone()).unwrap();
    let target = record("f", &data, &[1, 0]);
    fileset.replace(1, vec![target.clone()]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        fileset.get(LOCAL_PEER, "f").is_none(),
        "nothing may publish while every request fails"
    );

    // Once the peer heals, the next need cycle retries and completes.
    chaos.set_failure_rate(0.0).await;
    wait_until("file published after recovery", || {
        fileset
            .get(LOCAL_PEER, "f")
            .map(|f| f.same_version(&target))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), data);

    handle.stop().await;
}

#[tokio::test]
async fn test_pull_into_subdirectory() {
    let dir = TempDir::new().unwrap();
    let fileset = Arc::new(FileSet::new());

    let data = content(&[7, 8]);
    let peer = Arc::new(FakePeer::new("peer-1"));
    peer.add_file("sub/dir/f.txt", &data);
    let pool = Arc::new(ConnectionPool::new("local"));
    pool.add(peer).unwrap();
    let target = record("sub/dir/f.txt", &data, &[1, 0]);
    fileset.replace(1, vec![target.clone()]);

    let handle = Puller::new("default", dir.path(), fileset.clone(), pool, test_config()).start();

    wait_until("nested file published", || {
        fileset
            .get(LOCAL_PEER, "sub/dir/f.txt")
            .map(|f| f.same_version(&target))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        std::fs::read(dir.path().join("sub/dir/f.txt")).unwrap(),
        data
    );

    handle.stop().await;
}
