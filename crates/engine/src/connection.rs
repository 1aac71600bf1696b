//! The transport seam: what the engine requires from a peer connection.
//!
//! Concrete transports (TLS, wire encoding) live outside the core; the
//! engine only ever talks to this trait.

use async_trait::async_trait;
use blocksync_fileset::FileRecord;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No connected peer publishes the requested file.
    #[error("file unavailable")]
    Unavailable,
    /// The peer answered with an error.
    #[error("peer error: {0}")]
    Remote(String),
    #[error("request I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer counters reported by a connection.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub at: SystemTime,
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            at: SystemTime::UNIX_EPOCH,
            in_bytes_total: 0,
            out_bytes_total: 0,
        }
    }
}

/// One established connection to a peer.
///
/// Responses to [`request`](Connection::request) are full-size or an
/// error; partial reads are not permitted at this layer.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// The peer's long stable id.
    fn id(&self) -> &str;

    /// Deliver a full file listing for `repo` to the peer.
    async fn index(&self, repo: &str, files: Vec<FileRecord>);

    /// Request `size` bytes at `offset` of `name` in `repo`.
    async fn request(
        &self,
        repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, RequestError>;

    fn statistics(&self) -> Statistics;

    /// A connection-level option negotiated at handshake, if present.
    fn option(&self, key: &str) -> Option<String>;
}
