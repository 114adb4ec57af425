//! Partition ownership.
//!
//! Exactly one worker owns a partition at any time. A claim on an owned
//! partition fails instead of waiting.

use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Identifier of a partition worker.
pub type WorkerId = Uuid;

/// Maps each assigned partition to the worker that owns it.
#[derive(Debug, Default)]
pub struct PartitionAssignment {
    owners: DashMap<i32, WorkerId>,
}

impl PartitionAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `partition` for a new worker.
    pub fn claim(&self, partition: i32) -> Result<WorkerId> {
        match self.owners.entry(partition) {
            Entry::Occupied(owner) => Err(Error::InvalidState(format!(
                "partition {} is already owned by worker {}",
                partition,
                owner.get()
            ))),
            Entry::Vacant(slot) => {
                let worker = Uuid::new_v4();
                slot.insert(worker);
                Ok(worker)
            }
        }
    }

    /// Give up `partition`. Only its current owner can release it.
    pub fn release(&self, partition: i32, worker: WorkerId) -> bool {
        self.owners
            .remove_if(&partition, |_, owner| *owner == worker)
            .is_some()
    }

    pub fn owner(&self, partition: i32) -> Option<WorkerId> {
        self.owners.get(&partition).map(|owner| *owner)
    }

    /// Owned partitions, sorted.
    pub fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.owners.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
