//! blocksync-engine: the synchronization engine.
//!
//! Consumes the file set's `need` query and turns it into per-block
//! copy and fetch work, bounded by a request-slot semaphore and spread
//! across peers by least-busy selection. Also hosts the cluster model
//! that feeds peer indexes into the file sets and serves block requests.

pub mod chaos;
pub mod connection;
pub mod diff;
pub mod model;
pub mod puller;
pub mod queue;

pub use connection::{Connection, RequestError, Statistics};
pub use diff::{block_diff, BlockDiff, CopySource};
pub use model::{ConnectionPool, Model};
pub use puller::{sweep_stale_temps, PullConfig, PullError, Puller, PullerHandle, Scanner};
pub use queue::{BlockQueue, PullOrder, WorkItem};
