//! Best-effort index snapshot persistence.
//!
//! One gzip-compressed snapshot per (repository, directory) pair, named
//! by the SHA-1 of `repo|dir`. Snapshots only warm the local map at boot;
//! a missing or corrupt file simply means the index is rebuilt from the
//! next walk and from peer deliveries.

use crate::file::FileRecord;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    repository: String,
    files: Vec<FileRecord>,
}

/// Snapshot file name for a (repository, directory) pair.
pub fn index_file_name(repo: &str, dir: &str) -> String {
    let mut h = Sha1::new();
    h.update(repo.as_bytes());
    h.update(b"|");
    h.update(dir.as_bytes());
    format!("{}.idx.gz", hex::encode(h.finalize()))
}

/// Write a snapshot, going through a `.tmp` sibling and a rename so a
/// crash never leaves a half-written snapshot under the final name.
pub fn save_index(
    conf_dir: &Path,
    repo: &str,
    dir: &str,
    files: &[FileRecord],
) -> Result<(), PersistError> {
    std::fs::create_dir_all(conf_dir)?;
    let full = conf_dir.join(index_file_name(repo, dir));
    let tmp = full.with_extension("gz.tmp");

    let snapshot = IndexSnapshot {
        repository: repo.to_string(),
        files: files.to_vec(),
    };
    let mut gz = GzEncoder::new(
        BufWriter::new(File::create(&tmp)?),
        Compression::default(),
    );
    serde_json::to_writer(&mut gz, &snapshot)?;
    gz.finish()?.flush()?;
    std::fs::rename(&tmp, &full)?;
    tracing::debug!(repo, files = files.len(), path = %full.display(), "saved index snapshot");
    Ok(())
}

/// Load a snapshot. Missing, unreadable, corrupt, and repo-mismatched
/// files all read as "no cached index".
pub fn load_index(conf_dir: &Path, repo: &str, dir: &str) -> Vec<FileRecord> {
    let full = conf_dir.join(index_file_name(repo, dir));
    let file = match File::open(&full) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let gz = GzDecoder::new(BufReader::new(file));
    match serde_json::from_reader::<_, IndexSnapshot>(gz) {
        Ok(snapshot) if snapshot.repository == repo => {
            tracing::debug!(repo, files = snapshot.files.len(), "loaded index snapshot");
            snapshot.files
        }
        Ok(_) => {
            tracing::warn!(repo, path = %full.display(), "snapshot belongs to another repository");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(repo, path = %full.display(), "discarding corrupt snapshot: {}", e);
            Vec::new()
        }
    }
}
