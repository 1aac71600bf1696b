//! Filesystem walker: turns a repository directory into file records.

use blocksync_common::LOCAL_PEER;
use blocksync_engine::puller::TEMP_PREFIX;
use blocksync_engine::Scanner;
use blocksync_fileset::blocks::hash_blocks;
use blocksync_fileset::{FileRecord, FileSet};
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Walks a directory tree and produces file records.
///
/// Consults the file set's current local map: files whose size, mtime,
/// and mode are unchanged keep their block list and version; anything
/// else is re-hashed and marked changed, so the file set bumps its
/// version on insert.
pub struct DirScanner {
    dir: PathBuf,
    fileset: Arc<FileSet>,
    block_size: usize,
    follow_symlinks: bool,
    /// Directory to skip entirely (the index snapshot dir, when nested
    /// inside the repository).
    excluded: Option<PathBuf>,
}

impl DirScanner {
    pub fn new(
        dir: impl Into<PathBuf>,
        fileset: Arc<FileSet>,
        block_size: usize,
        follow_symlinks: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            fileset,
            block_size,
            follow_symlinks,
            excluded: None,
        }
    }

    pub fn with_excluded(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded = Some(dir.into());
        self
    }

    fn scan_one(&self, path: &Path, name: &str) -> std::io::Result<FileRecord> {
        let meta = std::fs::metadata(path)?;
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mode = meta.permissions().mode() & 0o777;

        let current = self.fileset.get(LOCAL_PEER, name);
        if let Some(cur) = &current {
            if !cur.is_deleted()
                && cur.modified == modified
                && cur.size == meta.len()
                && cur.mode() == mode
            {
                // Unchanged: keep the existing blocks and version.
                return Ok(cur.clone());
            }
        }

        let (size, blocks) = hash_blocks(File::open(path)?, self.block_size)?;
        Ok(FileRecord {
            name: name.to_string(),
            flags: mode,
            modified,
            // The file set bumps this at the local index on insert.
            version: current.map(|c| c.version).unwrap_or_default(),
            size,
            blocks,
            changed: true,
        })
    }
}

impl Scanner for DirScanner {
    fn walk(&self) -> std::io::Result<Vec<FileRecord>> {
        let mut out = Vec::new();
        let walker = WalkDir::new(&self.dir)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(|e| {
                if let Some(excluded) = &self.excluded {
                    if e.path() == excluded {
                        return false;
                    }
                }
                !e.file_name().to_string_lossy().starts_with(TEMP_PREFIX)
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), "walk error: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.dir) else {
                continue;
            };
            let Some(name) = rel.to_str() else {
                tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            };

            match self.scan_one(entry.path(), name) {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(file = name, "scan failed: {}", e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BS: usize = 16;

    fn scanner(dir: &TempDir, fileset: &Arc<FileSet>) -> DirScanner {
        DirScanner::new(dir.path(), fileset.clone(), BS, true)
    }

    #[test]
    fn test_walk_produces_changed_records() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), vec![7u8; 40]).unwrap();

        let fileset = Arc::new(FileSet::new());
        let mut files = scanner(&dir, &fileset).walk().unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.txt");
        assert_eq!(files[1].name, "sub/b.txt");
        assert!(files.iter().all(|f| f.changed));
        assert_eq!(files[0].size, 5);
        assert_eq!(files[1].blocks.len(), 3);
    }

    #[test]
    fn test_unchanged_files_keep_version_and_blocks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"stable").unwrap();

        let fileset = Arc::new(FileSet::new());
        let scanner = scanner(&dir, &fileset);

        let first = scanner.walk().unwrap();
        fileset.replace_with_delete(LOCAL_PEER, first);
        let recorded = fileset.get(LOCAL_PEER, "a.txt").unwrap();
        assert!(recorded.version.counters().iter().any(|&c| c > 0));

        let second = scanner.walk().unwrap();
        assert_eq!(second.len(), 1);
        assert!(!second[0].changed);
        assert_eq!(second[0].version, recorded.version);
        assert_eq!(second[0].blocks, recorded.blocks);

        // Feeding the unchanged listing back is a no-op.
        let changes = fileset.changes(LOCAL_PEER);
        fileset.replace_with_delete(LOCAL_PEER, second);
        assert_eq!(fileset.changes(LOCAL_PEER), changes);
    }

    #[test]
    fn test_modified_file_is_rescanned_with_prior_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"one").unwrap();

        let fileset = Arc::new(FileSet::new());
        let scanner = scanner(&dir, &fileset);
        fileset.replace_with_delete(LOCAL_PEER, scanner.walk().unwrap());
        let v1 = fileset.get(LOCAL_PEER, "a.txt").unwrap().version;

        std::fs::write(&path, b"two, but longer").unwrap();
        fileset.replace_with_delete(LOCAL_PEER, scanner.walk().unwrap());
        let after = fileset.get(LOCAL_PEER, "a.txt").unwrap();
        assert!(after.version.newer_than(&v1));
        assert_eq!(after.size, 15);
    }

    #[test]
    fn test_temp_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".blocksync.partial"), b"x").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"x").unwrap();

        let fileset = Arc::new(FileSet::new());
        let files = scanner(&dir, &fileset).walk().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "real.txt");
    }

    #[test]
    fn test_excluded_dir_is_skipped() {
        let dir = TempDir::new().unwrap();
        let index_dir = dir.path().join("index");
        std::fs::create_dir(&index_dir).unwrap();
        std::fs::write(index_dir.join("cache.idx.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"x").unwrap();

        let fileset = Arc::new(FileSet::new());
        let files = DirScanner::new(dir.path(), fileset, BS, true)
            .with_excluded(&index_dir)
            .walk()
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "real.txt");
    }

    #[test]
    fn test_deleted_then_recreated_file_resurrects_with_newer_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"v1").unwrap();

        let fileset = Arc::new(FileSet::new());
        let scanner = scanner(&dir, &fileset);
        fileset.replace_with_delete(LOCAL_PEER, scanner.walk().unwrap());
        let v1 = fileset.get(LOCAL_PEER, "a.txt").unwrap().version;

        std::fs::remove_file(&path).unwrap();
        fileset.replace_with_delete(LOCAL_PEER, scanner.walk().unwrap());
        let tomb = fileset.get(LOCAL_PEER, "a.txt").unwrap();
        assert!(tomb.is_deleted());
        assert!(tomb.version.newer_than(&v1));

        std::fs::write(&path, b"v2").unwrap();
        fileset.replace_with_delete(LOCAL_PEER, scanner.walk().unwrap());
        let back = fileset.get(LOCAL_PEER, "a.txt").unwrap();
        assert!(!back.is_deleted());
        assert!(back.version.newer_than(&tomb.version));
    }
}
