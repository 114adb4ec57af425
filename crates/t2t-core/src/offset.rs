//! In-memory offset bookkeeping per input partition.
//!
//! `delivered` is the last offset whose outputs were acknowledged by the sink,
//! `committed` the last offset durably recorded in the checkpoint store. The
//! engine never lets `committed` run ahead of `delivered`.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks pulled, delivered and committed offsets for each partition.
pub struct OffsetTracker {
    /// Last offset pulled from the source
    pulled: DashMap<i32, AtomicI64>,

    /// Last offset acknowledged by the sink
    delivered: DashMap<i32, AtomicI64>,

    /// Last offset committed to the checkpoint store
    committed: DashMap<i32, AtomicI64>,
}

fn store(map: &DashMap<i32, AtomicI64>, partition: i32, offset: i64) {
    map.entry(partition)
        .and_modify(|v| v.store(offset, Ordering::SeqCst))
        .or_insert_with(|| AtomicI64::new(offset));
}

fn load(map: &DashMap<i32, AtomicI64>, partition: i32) -> Option<i64> {
    map.get(&partition).map(|v| v.load(Ordering::SeqCst))
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self {
            pulled: DashMap::new(),
            delivered: DashMap::new(),
            committed: DashMap::new(),
        }
    }

    /// Seed a partition from its loaded checkpoint.
    pub fn restore(&self, partition: i32, committed: i64) {
        store(&self.pulled, partition, committed);
        store(&self.delivered, partition, committed);
        store(&self.committed, partition, committed);
    }

    pub fn mark_pulled(&self, partition: i32, offset: i64) {
        store(&self.pulled, partition, offset);
    }

    pub fn mark_delivered(&self, partition: i32, offset: i64) {
        store(&self.delivered, partition, offset);
    }

    pub fn mark_committed(&self, partition: i32, offset: i64) {
        store(&self.committed, partition, offset);
    }

    pub fn pulled(&self, partition: i32) -> Option<i64> {
        load(&self.pulled, partition)
    }

    pub fn delivered(&self, partition: i32) -> Option<i64> {
        load(&self.delivered, partition)
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        load(&self.committed, partition)
    }

    /// Records pulled but not yet committed.
    pub fn lag(&self, partition: i32) -> Option<i64> {
        let pulled = self.pulled(partition)?;
        match self.committed(partition) {
            Some(committed) => Some(pulled - committed),
            None => Some(pulled + 1),
        }
    }

    /// Whether committing `offset` keeps `committed <= delivered`.
    pub fn can_commit(&self, partition: i32, offset: i64) -> bool {
        self.delivered(partition).is_some_and(|d| offset <= d)
    }

    /// All partitions seen so far, sorted.
    pub fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.pulled.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    /// Forget a partition after its worker stopped.
    pub fn remove(&self, partition: i32) {
        self.pulled.remove(&partition);
        self.delivered.remove(&partition);
        self.committed.remove(&partition);
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}
