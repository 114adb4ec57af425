//! Source connectors.
//!
//! A [`SourceConnector`] resolves the partitions of an input topic and hands
//! out one [`PartitionReader`] per partition. Readers take `&mut self`, so a
//! read cursor is owned by exactly one worker at a time.

mod memory;

pub use memory::MemorySource;

use crate::record::Batch;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Pulls records from an input topic.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Input topic name.
    fn topic(&self) -> &str;

    /// Partitions of the input topic.
    async fn partitions(&self) -> Result<Vec<i32>>;

    /// Open an exclusive read cursor on one partition.
    ///
    /// Without a `seek`, the cursor starts at the connector's configured
    /// reset position.
    async fn open(&self, partition: i32) -> Result<Box<dyn PartitionReader>>;
}

/// Exclusive read cursor on a single partition.
#[async_trait]
pub trait PartitionReader: Send {
    fn partition(&self) -> i32;

    /// Wait up to `timeout` for records and return at most `max_batch_size`
    /// of them in offset order. Returns an empty batch on timeout.
    async fn pull(&mut self, max_batch_size: usize, timeout: Duration) -> Result<Batch>;

    /// Reposition so the next pulled record has an offset `>= offset`.
    async fn seek(&mut self, offset: i64) -> Result<()>;
}
