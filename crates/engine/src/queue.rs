//! Ordered handoff between the need planner and the pull scheduler.

use crate::diff::CopySource;
use blocksync_fileset::{BlockInfo, FileRecord};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// One planned file: the wanted record plus its block diff.
#[derive(Debug, Clone)]
pub struct PullOrder {
    pub file: FileRecord,
    pub have: Vec<CopySource>,
    pub need: Vec<BlockInfo>,
}

/// One unit of scheduler work. Either a batch of local copies, a single
/// remote fetch, or an empty marker for files with no block work.
/// `last` tags the final item of each file so the scheduler knows when
/// to finalize.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub file: FileRecord,
    pub copy: Vec<CopySource>,
    pub fetch: Option<BlockInfo>,
    pub last: bool,
}

/// FIFO of work items. Orders are expanded atomically on `put`, so one
/// file's items are never interleaved with another's.
#[derive(Default)]
pub struct BlockQueue {
    queued: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand and enqueue one planned file.
    pub fn put(&self, order: PullOrder) {
        let PullOrder { file, have, need } = order;
        let mut items = Vec::with_capacity(need.len() + 1);
        let fetches = need.len();

        if !have.is_empty() {
            items.push(WorkItem {
                file: file.clone(),
                copy: have,
                fetch: None,
                last: fetches == 0,
            });
        }
        for (i, block) in need.into_iter().enumerate() {
            items.push(WorkItem {
                file: file.clone(),
                copy: Vec::new(),
                fetch: Some(block),
                last: i == fetches - 1,
            });
        }
        if items.is_empty() {
            // No blocks at all: deletions and metadata-only changes.
            items.push(WorkItem {
                file,
                copy: Vec::new(),
                fetch: None,
                last: true,
            });
        }

        let mut q = self.queued.lock().expect("block queue lock poisoned");
        q.extend(items);
        drop(q);
        self.notify.notify_one();
    }

    /// Await the next work item.
    pub async fn get(&self) -> WorkItem {
        loop {
            if let Some(item) = self
                .queued
                .lock()
                .expect("block queue lock poisoned")
                .pop_front()
            {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queued.lock().expect("block queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_fileset::VersionVector;

    fn rec(name: &str) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            flags: 0o644,
            modified: 0,
            version: VersionVector::from_counters(vec![1]),
            size: 0,
            blocks: Vec::new(),
            changed: false,
        }
    }

    fn blk(offset: u64, tag: u8) -> BlockInfo {
        BlockInfo {
            offset,
            size: 16,
            hash: [tag; 32],
        }
    }

    fn copy_src(tag: u8) -> CopySource {
        CopySource {
            hash: [tag; 32],
            offset: 0,
            size: 16,
            local_offset: 0,
        }
    }

    async fn drain(q: &BlockQueue) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while !q.is_empty() {
            items.push(q.get().await);
        }
        items
    }

    #[tokio::test]
    async fn test_expands_copies_then_fetches() {
        let q = BlockQueue::new();
        q.put(PullOrder {
            file: rec("f"),
            have: vec![copy_src(1), copy_src(2)],
            need: vec![blk(0, 3), blk(16, 4)],
        });

        let items = drain(&q).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].copy.len(), 2);
        assert!(items[0].fetch.is_none());
        assert!(!items[0].last);
        assert_eq!(items[1].fetch.as_ref().unwrap().hash, [3; 32]);
        assert!(!items[1].last);
        assert_eq!(items[2].fetch.as_ref().unwrap().hash, [4; 32]);
        assert!(items[2].last);
    }

    #[tokio::test]
    async fn test_copy_only_file_is_single_last_item() {
        let q = BlockQueue::new();
        q.put(PullOrder {
            file: rec("f"),
            have: vec![copy_src(1)],
            need: vec![],
        });
        let items = drain(&q).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].last);
        assert!(items[0].fetch.is_none());
    }

    #[tokio::test]
    async fn test_blockless_file_yields_empty_marker() {
        let q = BlockQueue::new();
        q.put(PullOrder {
            file: rec("gone"),
            have: vec![],
            need: vec![],
        });
        let items = drain(&q).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].last);
        assert!(items[0].copy.is_empty());
        assert!(items[0].fetch.is_none());
    }

    #[tokio::test]
    async fn test_files_are_not_interleaved() {
        let q = BlockQueue::new();
        q.put(PullOrder {
            file: rec("a"),
            have: vec![],
            need: vec![blk(0, 1), blk(16, 2)],
        });
        q.put(PullOrder {
            file: rec("b"),
            have: vec![],
            need: vec![blk(0, 3)],
        });

        let items = drain(&q).await;
        let names: Vec<&str> = items.iter().map(|i| i.file.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a", "b"]);
        assert!(items[1].last && items[2].last);
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let q = std::sync::Arc::new(BlockQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.put(PullOrder {
            file: rec("late"),
            have: vec![],
            need: vec![],
        });

        let item = waiter.await.unwrap();
        assert_eq!(item.file.name, "late");
    }
}
