//! Offset checkpoint stores.
//!
//! A checkpoint is the last fully processed input offset of a partition:
//! every output derived from it and from all lower offsets has been
//! acknowledged by the sink. Restarting resumes at `checkpoint + 1`.
//!
//! Stores reject commits that would move a partition backwards. Committing
//! the current value again is a no-op.

mod entries;
mod file;
mod recovery;

pub use entries::CheckpointEntry;
pub use file::FileCheckpointStore;
pub use recovery::{replay, RecoveredCheckpoints};

use crate::error::CheckpointError;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Durable per-partition committed offsets.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed offset for a partition, if any.
    async fn load(&self, partition: i32) -> Result<Option<i64>>;

    /// Durably record `offset` as processed. Returns once the write is durable.
    async fn commit(&self, partition: i32, offset: i64) -> Result<()>;

    /// Persist anything buffered.
    async fn flush(&self) -> Result<()>;

    /// All committed offsets.
    async fn snapshot(&self) -> Result<BTreeMap<i32, i64>>;
}

/// Check a commit against the stored offset.
///
/// Returns `Ok(true)` when the offset advances and must be written,
/// `Ok(false)` when it equals the stored offset.
pub(crate) fn check_advance(
    partition: i32,
    current: Option<i64>,
    attempted: i64,
) -> Result<bool> {
    match current {
        Some(committed) if attempted < committed => Err(CheckpointError::Regression {
            partition,
            committed,
            attempted,
        }
        .into()),
        Some(committed) if attempted == committed => Ok(false),
        _ => Ok(true),
    }
}

#[derive(Default)]
struct MemoryInner {
    offsets: Mutex<BTreeMap<i32, i64>>,
    history: Mutex<Vec<(i32, i64)>>,
    failing: AtomicBool,
    flushes: AtomicU64,
}

/// Non-durable store that keeps its commit history for assertions.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<MemoryInner>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed committed offsets, as if left by a previous run.
    pub fn with_offsets(offsets: impl IntoIterator<Item = (i32, i64)>) -> Self {
        let store = Self::new();
        store.inner.offsets.lock().extend(offsets);
        store
    }

    /// Make every following commit fail until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Every commit that was written, in order.
    pub fn history(&self) -> Vec<(i32, i64)> {
        self.inner.history.lock().clone()
    }

    /// Commits written for one partition, in order.
    pub fn history_for(&self, partition: i32) -> Vec<i64> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| *o)
            .collect()
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, partition: i32) -> Result<Option<i64>> {
        Ok(self.inner.offsets.lock().get(&partition).copied())
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("memory store set to fail".into()).into());
        }

        let mut offsets = self.inner.offsets.lock();
        if check_advance(partition, offsets.get(&partition).copied(), offset)? {
            offsets.insert(partition, offset);
            self.inner.history.lock().push((partition, offset));
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<i32, i64>> {
        Ok(self.inner.offsets.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_check_advance() {
        assert!(check_advance(0, None, 0).unwrap());
        assert!(check_advance(0, Some(5), 6).unwrap());
        assert!(!check_advance(0, Some(5), 5).unwrap());
        assert!(matches!(
            check_advance(0, Some(5), 4),
            Err(Error::Checkpoint(CheckpointError::Regression {
                committed: 5,
                attempted: 4,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_commit_and_load() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load(0).await.unwrap(), None);

        store.commit(0, 10).await.unwrap();
        store.commit(1, 3).await.unwrap();
        store.commit(0, 10).await.unwrap();

        assert_eq!(store.load(0).await.unwrap(), Some(10));
        assert_eq!(store.history(), vec![(0, 10), (1, 3)]);
        assert_eq!(store.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_regression() {
        let store = MemoryCheckpointStore::with_offsets([(0, 50)]);
        assert!(store.commit(0, 49).await.is_err());
        assert_eq!(store.load(0).await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_memory_store_failure_switch() {
        let store = MemoryCheckpointStore::new();
        store.set_failing(true);
        let err = store.commit(0, 1).await.unwrap_err();
        assert!(!err.is_retryable());

        store.set_failing(false);
        store.commit(0, 1).await.unwrap();
        assert_eq!(store.history_for(0), vec![1]);
    }
}
