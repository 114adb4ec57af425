//! Sink connectors.
//!
//! A [`SinkConnector`] publishes transformed records and only returns an
//! [`Acknowledgment`] once the destination has durably accepted them.

mod memory;

pub use memory::MemorySink;

use crate::record::Record;
use crate::Result;
use async_trait::async_trait;

/// Confirmation that a publish was durably accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    /// Input partition the records came from
    pub partition: i32,
    /// Number of records accepted
    pub records: usize,
    /// Highest input offset covered, `None` for an empty publish
    pub last_offset: Option<i64>,
}

impl Acknowledgment {
    /// Acknowledgment covering `records`.
    pub fn for_records(partition: i32, records: &[Record]) -> Self {
        Self {
            partition,
            records: records.len(),
            last_offset: records.iter().map(Record::offset).max(),
        }
    }
}

/// Publishes records to an output topic.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    /// Output topic name.
    fn topic(&self) -> &str;

    /// Publish records derived from input `partition`, in order.
    ///
    /// Returns only after every record is durably accepted. Publishing an
    /// empty slice acknowledges immediately.
    async fn publish(&self, partition: i32, records: &[Record]) -> Result<Acknowledgment>;

    /// Wait for anything still buffered to be delivered.
    async fn flush(&self) -> Result<()>;

    /// Whether retried publishes are deduplicated by the destination.
    fn is_idempotent(&self) -> bool;
}
