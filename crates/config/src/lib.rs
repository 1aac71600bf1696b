//! Configuration schema and loader for blocksync nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Repositories replicated by this node.
    pub repositories: Vec<RepositoryConfig>,

    /// Synchronization options.
    #[serde(default)]
    pub options: Options,

    /// Directory holding index snapshots. Defaults to `.blocksync-index`.
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// One replicated repository: a directory shared with a set of peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Cluster-wide repository id.
    pub id: String,

    /// Local directory backing the repository.
    pub directory: PathBuf,

    /// Long stable ids of the peers this repository is shared with.
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Seconds between filesystem rescans.
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,

    /// Seconds between reconnect attempts to unreachable peers.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Number of pull request slots (bound on in-flight block work).
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: usize,

    /// Change-rate threshold handed to the scanner's suppressor.
    #[serde(default = "default_max_change_kbps")]
    pub max_change_kbps: u64,

    /// Whether deletions announced by peers are applied locally.
    #[serde(default = "default_true")]
    pub allow_delete: bool,

    /// Whether the scanner follows symlinks.
    #[serde(default = "default_true")]
    pub follow_symlinks: bool,

    /// Publish-only mode: serve blocks and indexes, never pull.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rescan_interval_secs: default_rescan_interval_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            parallel_requests: default_parallel_requests(),
            max_change_kbps: default_max_change_kbps(),
            allow_delete: true,
            follow_symlinks: true,
            read_only: false,
        }
    }
}

// --- Defaults ---

fn default_rescan_interval_secs() -> u64 {
    60
}
fn default_reconnect_interval_secs() -> u64 {
    60
}
fn default_parallel_requests() -> usize {
    16
}
fn default_max_change_kbps() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_index_dir() -> PathBuf {
    PathBuf::from(".blocksync-index")
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.options.parallel_requests == 0 {
            return Err(ConfigError::Invalid(
                "options.parallel_requests must be > 0".into(),
            ));
        }
        if self.options.rescan_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "options.rescan_interval_secs must be > 0".into(),
            ));
        }
        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.id.is_empty() {
                return Err(ConfigError::Invalid("repository id must not be empty".into()));
            }
            if !seen.insert(repo.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate repository id {:?}",
                    repo.id
                )));
            }
            if repo.directory.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "repository {:?} has no directory",
                    repo.id
                )));
            }
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
