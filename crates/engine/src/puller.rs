//! The block-pull scheduler.
//!
//! One task owns all per-open-file state. A filler task pairs each
//! queued work item with a request slot; copy and empty items give the
//! slot back as soon as they are handled, fetch items carry it into the
//! spawned request and back through the results channel, so the number
//! of in-flight requests never exceeds the slot count.

use crate::connection::{Connection, RequestError};
use crate::diff::block_diff;
use crate::model::ConnectionPool;
use crate::queue::{BlockQueue, PullOrder, WorkItem};
use blocksync_fileset::blocks::{hash_blocks, BLOCK_SIZE};
use blocksync_fileset::{persist, FileRecord, FileSet};
use blocksync_common::LOCAL_PEER;
use blocksync_metrics::metrics;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Prefix of in-progress download files. Anything carrying it is scratch
/// state and may be swept at boot.
pub const TEMP_PREFIX: &str = ".blocksync.";

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("no connected peer has the file")]
    Unavailable,
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block hashes do not match the announced list")]
    HashMismatch,
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Number of request slots (bound on in-flight block work).
    pub slots: usize,
    /// Cluster-wide block size.
    pub block_size: usize,
    /// How often to recompute the need set when idle.
    pub need_interval: Duration,
    /// How often to rescan the repository directory.
    pub rescan_interval: Duration,
    /// Whether deletions announced by peers are applied locally.
    pub allow_delete: bool,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            slots: 16,
            block_size: BLOCK_SIZE,
            need_interval: Duration::from_secs(5),
            rescan_interval: Duration::from_secs(60),
            allow_delete: true,
        }
    }
}

/// Produces the current on-disk file listing for a repository.
/// Implementations do blocking I/O; the scheduler calls them from a
/// blocking task.
pub trait Scanner: Send + Sync + 'static {
    fn walk(&self) -> std::io::Result<Vec<FileRecord>>;
}

struct RequestResult {
    peer: String,
    file: FileRecord,
    offset: u64,
    data: Result<Vec<u8>, RequestError>,
    // Returning the slot is tied to this result being processed.
    permit: OwnedSemaphorePermit,
}

struct OpenFile {
    record: FileRecord,
    dest: PathBuf,
    temp: PathBuf,
    /// Availability bitmap captured while the file is open.
    availability: u64,
    file: Option<File>,
    /// Sticky: once set, remaining work items only drain the queue.
    error: Option<PullError>,
    outstanding: usize,
    done: bool,
}

/// Handle to a running puller.
pub struct PullerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PullerHandle {
    /// Signal shutdown and wait for the scheduler task to exit.
    /// In-flight requests are abandoned.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// The per-repository pull scheduler.
pub struct Puller<C: Connection + ?Sized> {
    repo: String,
    dir: PathBuf,
    fileset: Arc<FileSet>,
    pool: Arc<ConnectionPool<C>>,
    config: PullConfig,
    scanner: Option<Arc<dyn Scanner>>,
    index_dir: Option<PathBuf>,

    bq: Arc<BlockQueue>,
    slots: Arc<Semaphore>,
    activity: HashMap<String, usize>,
    open_files: HashMap<String, OpenFile>,
    /// Files planned in the current need cycle whose open-file entry has
    /// not been closed yet. The need set is only recomputed at zero, so
    /// a file is never planned twice concurrently.
    active_files: usize,
    results_tx: mpsc::Sender<RequestResult>,
    results_rx: Option<mpsc::Receiver<RequestResult>>,
}

impl<C: Connection + ?Sized> Puller<C> {
    pub fn new(
        repo: impl Into<String>,
        dir: impl Into<PathBuf>,
        fileset: Arc<FileSet>,
        pool: Arc<ConnectionPool<C>>,
        config: PullConfig,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(config.slots.max(1));
        Self {
            repo: repo.into(),
            dir: dir.into(),
            fileset,
            pool,
            config,
            scanner: None,
            index_dir: None,
            bq: Arc::new(BlockQueue::new()),
            slots: Arc::new(Semaphore::new(0)),
            activity: HashMap::new(),
            open_files: HashMap::new(),
            active_files: 0,
            results_tx,
            results_rx: Some(results_rx),
        }
    }

    /// Attach a scanner; rescan ticks are skipped without one.
    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Persist an index snapshot to this directory after each rescan.
    pub fn with_index_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.index_dir = Some(dir.into());
        self
    }

    /// Spawn the scheduler task.
    pub fn start(self) -> PullerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tracing::info!(
            repo = %self.repo,
            dir = %self.dir.display(),
            slots = self.config.slots,
            "starting puller"
        );
        let task = tokio::spawn(self.run(shutdown_rx));
        PullerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut results_rx = self.results_rx.take().expect("run called once");

        self.slots.add_permits(self.config.slots);

        // Filler: pair a free slot with the next queued work item.
        let (blocks_tx, mut blocks_rx) = mpsc::channel::<(WorkItem, OwnedSemaphorePermit)>(1);
        let filler = {
            let bq = self.bq.clone();
            let slots = self.slots.clone();
            tokio::spawn(async move {
                loop {
                    let Ok(permit) = slots.clone().acquire_owned().await else {
                        break;
                    };
                    let item = bq.get().await;
                    if blocks_tx.send((item, permit)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut need_tick = tokio::time::interval(self.config.need_interval);
        let mut walk_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.rescan_interval,
            self.config.rescan_interval,
        );

        loop {
            tokio::select! {
                Some(res) = results_rx.recv() => self.handle_request_result(res),
                Some((item, permit)) = blocks_rx.recv() => self.handle_block(item, permit),
                _ = walk_tick.tick() => self.rescan().await,
                _ = need_tick.tick() => {
                    if self.active_files == 0 {
                        self.queue_needed_blocks();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::debug!(repo = %self.repo, "puller stopped");
        filler.abort();
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    fn queue_needed_blocks(&mut self) {
        for file in self.fileset.need(LOCAL_PEER) {
            if file.is_invalid() {
                continue;
            }
            if file.is_deleted() && !self.config.allow_delete {
                continue;
            }
            let local_blocks = self
                .fileset
                .get(LOCAL_PEER, &file.name)
                .map(|l| l.blocks)
                .unwrap_or_default();
            let diff = block_diff(&local_blocks, &file.blocks);
            tracing::debug!(
                repo = %self.repo,
                file = %file.name,
                copy = diff.have.len(),
                fetch = diff.need.len(),
                "queueing pull"
            );
            self.active_files += 1;
            self.bq.put(PullOrder {
                file,
                have: diff.have,
                need: diff.need,
            });
        }
    }

    async fn rescan(&mut self) {
        let Some(scanner) = self.scanner.clone() else {
            return;
        };
        tracing::debug!(repo = %self.repo, "rescan");
        match tokio::task::spawn_blocking(move || scanner.walk()).await {
            Ok(Ok(files)) => {
                self.fileset.replace_with_delete(LOCAL_PEER, files);
                if let Some(index_dir) = &self.index_dir {
                    let files = self.fileset.have(LOCAL_PEER);
                    let dir = self.dir.to_string_lossy();
                    if let Err(e) = persist::save_index(index_dir, &self.repo, &dir, &files) {
                        tracing::warn!(repo = %self.repo, "failed to save index snapshot: {}", e);
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!(repo = %self.repo, "rescan failed: {}", e),
            Err(e) => tracing::warn!(repo = %self.repo, "rescan task failed: {}", e),
        }
    }

    // -----------------------------------------------------------------------
    // Work item handling
    // -----------------------------------------------------------------------

    fn handle_block(&mut self, item: WorkItem, permit: OwnedSemaphorePermit) {
        let name = item.file.name.clone();

        if !self.open_files.contains_key(&name) {
            self.open_file(&item);
        }
        let of = self.open_files.get_mut(&name).expect("opened above");
        of.done = item.last;

        if of.error.is_some() {
            // Sticky failure: remaining items only drain the queue.
            if item.last && of.outstanding == 0 {
                self.abandon(&name);
            }
            return;
        }

        of.availability = self.fileset.availability(&name);

        if !item.copy.is_empty() {
            self.handle_copy(&item);
        } else if matches!(&item.fetch, Some(b) if b.size > 0) {
            let block = item.fetch.clone().expect("checked above");
            self.handle_fetch(&item, block, permit);
        } else {
            self.handle_empty(&item);
        }
        // Copy and empty items return their slot here; fetch items moved
        // the permit into the request task.
    }

    fn open_file(&mut self, item: &WorkItem) {
        let f = &item.file;
        let dest = self.dir.join(&f.name);
        let temp = temp_path(&dest);
        tracing::debug!(repo = %self.repo, file = %f.name, temp = %temp.display(), "opening");

        let mut of = OpenFile {
            record: f.clone(),
            dest,
            temp,
            availability: 0,
            file: None,
            error: None,
            outstanding: 0,
            done: false,
        };

        let created = of
            .dest
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|()| File::create(&of.temp));
        match created {
            Ok(handle) => of.file = Some(handle),
            Err(e) => {
                tracing::warn!(repo = %self.repo, file = %f.name, "cannot open temp file: {}", e);
                metrics().pull_errors.inc();
                of.error = Some(e.into());
            }
        }
        self.open_files.insert(f.name.clone(), of);
    }

    fn handle_copy(&mut self, item: &WorkItem) {
        let name = &item.file.name;
        let of = self.open_files.get_mut(name).expect("file is open");

        let copied = copy_local_blocks(&of.dest, of.file.as_ref(), item);
        match copied {
            Ok(n) => metrics().blocks_copied.inc_by(n),
            Err(e) => {
                tracing::warn!(repo = %self.repo, file = %name, "copy failed: {}", e);
                metrics().pull_errors.inc();
                of.error = Some(e);
            }
        }
        self.maybe_finish(name);
    }

    fn handle_fetch(
        &mut self,
        item: &WorkItem,
        block: blocksync_fileset::BlockInfo,
        permit: OwnedSemaphorePermit,
    ) {
        let name = item.file.name.clone();
        let availability = self.open_files[&name].availability;

        let Some((peer, conn)) = self.pick_peer(availability) else {
            tracing::warn!(repo = %self.repo, file = %name, "no peer available");
            metrics().pull_errors.inc();
            let of = self.open_files.get_mut(&name).expect("file is open");
            of.error = Some(PullError::Unavailable);
            self.maybe_finish(&name);
            return;
        };

        let of = self.open_files.get_mut(&name).expect("file is open");
        of.outstanding += 1;
        tracing::debug!(
            repo = %self.repo,
            file = %name,
            offset = block.offset,
            size = block.size,
            peer = %peer,
            outstanding = of.outstanding,
            "requesting block"
        );

        let repo = self.repo.clone();
        let file = item.file.clone();
        let tx = self.results_tx.clone();
        metrics().requests_in_flight.inc();
        tokio::spawn(async move {
            let timer = metrics().request_latency_secs.start_timer();
            let data = match conn.request(&repo, &file.name, block.offset, block.size).await {
                Ok(bytes) if bytes.len() != block.size as usize => Err(RequestError::Remote(
                    format!("short response: {} of {} bytes", bytes.len(), block.size),
                )),
                other => other,
            };
            drop(timer);
            metrics().requests_in_flight.dec();
            let _ = tx
                .send(RequestResult {
                    peer,
                    file,
                    offset: block.offset,
                    data,
                    permit,
                })
                .await;
        });
    }

    fn handle_empty(&mut self, item: &WorkItem) {
        let name = &item.file.name;
        let mut of = self.close_entry(name).expect("file is open");
        of.file = None;

        if item.file.is_deleted() {
            let _ = std::fs::remove_file(&of.temp);
            match std::fs::remove_file(&of.dest) {
                Ok(()) => {
                    tracing::info!(repo = %self.repo, file = %name, "deleted");
                    metrics().files_deleted.inc();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(repo = %self.repo, file = %name, "delete failed: {}", e);
                    metrics().pull_errors.inc();
                    return;
                }
            }
        } else {
            // Nothing to copy or fetch: publish the (empty) temp file.
            if let Err(e) = apply_attrs_and_rename(&of.temp, &of.dest, &item.file) {
                tracing::warn!(repo = %self.repo, file = %name, "publish failed: {}", e);
                metrics().pull_errors.inc();
                let _ = std::fs::remove_file(&of.temp);
                return;
            }
            metrics().files_published.inc();
        }
        self.fileset.update(LOCAL_PEER, vec![item.file.clone()]);
    }

    // -----------------------------------------------------------------------
    // Results and completion
    // -----------------------------------------------------------------------

    fn handle_request_result(&mut self, res: RequestResult) {
        if let Some(count) = self.activity.get_mut(&res.peer) {
            *count = count.saturating_sub(1);
        }

        let name = res.file.name.clone();
        let Some(of) = self.open_files.get_mut(&name) else {
            // The file was abandoned while this request was in flight.
            return;
        };
        of.outstanding -= 1;

        if of.error.is_none() {
            match res.data {
                Ok(bytes) => match &of.file {
                    Some(file) => {
                        if let Err(e) = file.write_all_at(&bytes, res.offset) {
                            tracing::warn!(repo = %self.repo, file = %name, "write failed: {}", e);
                            metrics().pull_errors.inc();
                            of.error = Some(e.into());
                        } else {
                            metrics().blocks_fetched.inc();
                            metrics().fetched_bytes.inc_by(bytes.len() as u64);
                        }
                    }
                    None => of.error = Some(PullError::Io(std::io::Error::other(
                        "temp file closed with requests outstanding",
                    ))),
                },
                Err(e) => {
                    tracing::warn!(
                        repo = %self.repo,
                        file = %name,
                        peer = %res.peer,
                        "request failed: {}",
                        e
                    );
                    metrics().pull_errors.inc();
                    of.error = Some(e.into());
                }
            }
        }

        tracing::debug!(
            repo = %self.repo,
            file = %name,
            offset = res.offset,
            outstanding = self.open_files[&name].outstanding,
            "request result"
        );
        self.maybe_finish(&name);
        // The slot travels with `res.permit` and frees here.
    }

    /// Close out an open file once its last item was seen and no
    /// requests remain: verify, publish, and record locally, or discard.
    fn maybe_finish(&mut self, name: &str) {
        let ready = matches!(
            self.open_files.get(name),
            Some(of) if of.done && of.outstanding == 0
        );
        if !ready {
            return;
        }
        let mut of = self.close_entry(name).expect("checked above");
        of.file = None;

        if let Some(err) = &of.error {
            tracing::warn!(repo = %self.repo, file = %name, "abandoning pull: {}", err);
            let _ = std::fs::remove_file(&of.temp);
            return;
        }

        match self.finalize(&of) {
            Ok(()) => {
                tracing::info!(repo = %self.repo, file = %name, "pulled");
                metrics().files_published.inc();
                self.fileset.update(LOCAL_PEER, vec![of.record.clone()]);
            }
            Err(PullError::HashMismatch) => {
                tracing::warn!(repo = %self.repo, file = %name, "block hash mismatch, discarding");
                metrics().hash_failures.inc();
                let _ = std::fs::remove_file(&of.temp);
            }
            Err(e) => {
                tracing::warn!(repo = %self.repo, file = %name, "finalize failed: {}", e);
                metrics().pull_errors.inc();
                let _ = std::fs::remove_file(&of.temp);
            }
        }
    }

    /// Re-hash the assembled temp file, verify every block against the
    /// announced list, then apply attributes and rename into place.
    fn finalize(&self, of: &OpenFile) -> Result<(), PullError> {
        let temp = File::open(&of.temp)?;
        let (_, hashed) = hash_blocks(&temp, self.config.block_size)?;
        drop(temp);

        if hashed.len() != of.record.blocks.len() {
            return Err(PullError::HashMismatch);
        }
        for (got, want) in hashed.iter().zip(&of.record.blocks) {
            if got.hash != want.hash {
                return Err(PullError::HashMismatch);
            }
        }

        apply_attrs_and_rename(&of.temp, &of.dest, &of.record)?;
        Ok(())
    }

    fn abandon(&mut self, name: &str) {
        if let Some(of) = self.close_entry(name) {
            drop(of.file);
            let _ = std::fs::remove_file(&of.temp);
        }
    }

    /// Remove an open-file entry, releasing its claim on the current
    /// need cycle.
    fn close_entry(&mut self, name: &str) -> Option<OpenFile> {
        let of = self.open_files.remove(name);
        if of.is_some() {
            self.active_files = self.active_files.saturating_sub(1);
        }
        of
    }

    /// Least-busy selection over the availability bitmap, ties broken by
    /// index order. Charges the chosen peer immediately.
    fn pick_peer(&mut self, availability: u64) -> Option<(String, Arc<C>)> {
        let peers = self.pool.peers();
        let chosen = least_busy(&peers, &self.activity, availability)?;
        let (_, name, conn) = chosen;
        *self.activity.entry(name.clone()).or_default() += 1;
        Some((name.clone(), conn.clone()))
    }
}

fn least_busy<'a, C: ?Sized>(
    peers: &'a [(u32, String, Arc<C>)],
    activity: &HashMap<String, usize>,
    availability: u64,
) -> Option<&'a (u32, String, Arc<C>)> {
    let mut best: Option<&(u32, String, Arc<C>)> = None;
    let mut low = usize::MAX;
    for peer in peers {
        if availability & (1u64 << peer.0) == 0 {
            continue;
        }
        let usage = activity.get(&peer.1).copied().unwrap_or(0);
        if usage < low {
            low = usage;
            best = Some(peer);
        }
    }
    best
}

/// Copy the item's source blocks from the current destination file into
/// the temp file, each at its target offset.
fn copy_local_blocks(
    dest: &Path,
    temp: Option<&File>,
    item: &WorkItem,
) -> Result<u64, PullError> {
    let temp = temp.ok_or_else(|| {
        PullError::Io(std::io::Error::other("temp file closed during copy"))
    })?;
    let src = File::open(dest)?;
    let mut copied = 0u64;
    for block in &item.copy {
        let mut buf = vec![0u8; block.size as usize];
        src.read_exact_at(&mut buf, block.local_offset)?;
        temp.write_all_at(&buf, block.offset)?;
        copied += 1;
    }
    Ok(copied)
}

/// Apply the record's mtime and mode to `temp`, then atomically rename
/// it over `dest`.
fn apply_attrs_and_rename(temp: &Path, dest: &Path, record: &FileRecord) -> Result<(), PullError> {
    let handle = File::open(temp)?;
    let mtime = UNIX_EPOCH + Duration::from_secs(record.modified.max(0) as u64);
    handle.set_modified(mtime)?;
    drop(handle);
    std::fs::set_permissions(temp, std::fs::Permissions::from_mode(record.mode()))?;
    std::fs::rename(temp, dest)?;
    Ok(())
}

fn temp_path(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}{}", TEMP_PREFIX, file_name))
}

/// Remove leftover temp files from a crashed run. Called once per
/// repository directory at boot, before the initial walk.
pub fn sweep_stale_temps(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            removed += sweep_stale_temps(&path)?;
        } else if entry
            .file_name()
            .to_string_lossy()
            .starts_with(TEMP_PREFIX)
        {
            tracing::debug!(path = %path.display(), "removing stale temp file");
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
