//! Chaos injection wrapper for [`Connection`].
//!
//! [`ChaosConnection`] wraps any `C: Connection` and injects configurable
//! failures and latency into block requests. Index delivery is passed
//! through untouched. Test support for exercising the scheduler's
//! abandon-and-retry paths.

use crate::connection::{Connection, RequestError, Statistics};
use async_trait::async_trait;
use blocksync_fileset::FileRecord;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for request chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`Connection`] wrapper that injects failures and latency.
pub struct ChaosConnection<C> {
    inner: Arc<C>,
    config: Arc<RwLock<ChaosConfig>>,
    failed: AtomicBool,
}

impl<C: Connection> ChaosConnection<C> {
    pub fn new(inner: C, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            failed: AtomicBool::new(false),
        }
    }

    /// Mark the peer as failed: every request errors until recovery.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failed.store(false, Ordering::SeqCst);
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    async fn maybe_fail(&self) -> Result<(), RequestError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(RequestError::Remote("chaos: peer marked as failed".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(RequestError::Remote("chaos: random failure".into()));
        }

        Ok(())
    }
}

#[async_trait]
impl<C: Connection> Connection for ChaosConnection<C> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn index(&self, repo: &str, files: Vec<FileRecord>) {
        self.inner.index(repo, files).await
    }

    async fn request(
        &self,
        repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, RequestError> {
        self.maybe_fail().await?;
        self.inner.request(repo, name, offset, size).await
    }

    fn statistics(&self) -> Statistics {
        self.inner.statistics()
    }

    fn option(&self, key: &str) -> Option<String> {
        self.inner.option(key)
    }
}

// ────────────────────────── Tests ──────────────────────────
