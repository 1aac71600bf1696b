//! blocksync-node: entry point for a file synchronization node.
//!
//! Loads config, restores cached index snapshots, runs the initial
//! filesystem walk, then starts one pull scheduler per repository
//! (unless running read-only).

mod walk;

use blocksync_common::LOCAL_PEER;
use blocksync_engine::puller::sweep_stale_temps;
use blocksync_engine::{Connection, Model, PullConfig, Puller, PullerHandle, Scanner};
use blocksync_fileset::blocks::BLOCK_SIZE;
use blocksync_fileset::{persist, FileSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use walk::DirScanner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    blocksync_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = blocksync_config::load_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            blocksync_config::load_from_str("repositories: []\n")
                .expect("hardcoded default config must parse")
        });

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        tokio::spawn(async move {
            if let Err(e) = blocksync_metrics::serve_metrics(addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // The long stable id the transport authenticates us as.
    let local_id = std::env::var("BLOCKSYNC_ID").unwrap_or_else(|_| "local".to_string());
    tracing::info!(id = %local_id, repos = config.repositories.len(), "starting node");

    let mut model: Model<dyn Connection> = Model::new(local_id);
    let mut pullers: Vec<PullerHandle> = Vec::new();

    for repo in &config.repositories {
        let fileset = Arc::new(FileSet::new());
        let dir = repo.directory.clone();
        let dir_key = dir.to_string_lossy().into_owned();

        // Scratch files from a crashed run are useless; sweep them
        // before the walk sees anything.
        match sweep_stale_temps(&dir) {
            Ok(0) => {}
            Ok(n) => tracing::info!(repo = %repo.id, "swept {} stale temp file(s)", n),
            Err(e) => tracing::warn!(repo = %repo.id, "temp sweep failed: {}", e),
        }

        // Warm the local map from the cached snapshot, then walk.
        let cached = persist::load_index(&config.index_dir, &repo.id, &dir_key);
        if !cached.is_empty() {
            tracing::info!(repo = %repo.id, files = cached.len(), "loaded cached index");
            fileset.replace(LOCAL_PEER, cached);
        }

        let scanner: Arc<dyn Scanner> = Arc::new(DirScanner::new(
            dir.clone(),
            fileset.clone(),
            BLOCK_SIZE,
            config.options.follow_symlinks,
        ));

        tracing::info!(repo = %repo.id, dir = %dir.display(), "scanning");
        let walk_scanner = scanner.clone();
        let files = tokio::task::spawn_blocking(move || walk_scanner.walk()).await??;
        fileset.replace_with_delete(LOCAL_PEER, files);
        let have = fileset.have(LOCAL_PEER);
        tracing::info!(repo = %repo.id, files = have.len(), "scan complete");
        if let Err(e) = persist::save_index(&config.index_dir, &repo.id, &dir_key, &have) {
            tracing::warn!(repo = %repo.id, "failed to save index snapshot: {}", e);
        }

        model.add_repository(repo.id.as_str(), &dir, fileset.clone());

        if !config.options.read_only {
            let pull_config = PullConfig {
                slots: config.options.parallel_requests,
                block_size: BLOCK_SIZE,
                need_interval: Duration::from_secs(5),
                rescan_interval: Duration::from_secs(config.options.rescan_interval_secs),
                allow_delete: config.options.allow_delete,
            };
            let puller = Puller::new(
                repo.id.as_str(),
                &dir,
                fileset,
                model.pool(),
                pull_config,
            )
            .with_scanner(scanner)
            .with_index_dir(&config.index_dir);
            pullers.push(puller.start());
        }
    }

    if config.options.read_only {
        tracing::info!("ready to synchronize (read only; no external updates accepted)");
    } else {
        if config.options.allow_delete {
            tracing::info!("deletes from peer nodes are allowed");
        } else {
            tracing::info!("deletes from peer nodes will be ignored");
        }
        tracing::info!("ready to synchronize (read-write)");
    }

    // The model owns the file sets and the connection pool; the
    // transport layer delivers peer callbacks into it.
    let _model = Arc::new(model);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for handle in pullers {
        handle.stop().await;
    }
    Ok(())
}
