//! In-process source for tests and embedding.

use super::{PartitionReader, SourceConnector};
use crate::config::OffsetReset;
use crate::error::ConnectionError;
use crate::record::{Batch, Record};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

struct Inner {
    topic: String,
    partitions: RwLock<BTreeMap<i32, Vec<Record>>>,
    /// Bumped on every append so waiting readers wake up.
    version: watch::Sender<u64>,
    /// Injected pull failures left per partition.
    failures: DashMap<i32, u32>,
    start_from: OffsetReset,
}

/// A topic held in memory, partition -> ordered records.
///
/// Clones share the same topic, so a test can keep a handle for appending
/// while the engine reads.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl MemorySource {
    /// Create a topic with the given (empty) partitions.
    pub fn new(topic: impl Into<String>, partitions: impl IntoIterator<Item = i32>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                topic: topic.into(),
                partitions: RwLock::new(partitions.into_iter().map(|p| (p, Vec::new())).collect()),
                version,
                failures: DashMap::new(),
                start_from: OffsetReset::Earliest,
            }),
        }
    }

    /// Where readers without a seek start. Must be set before sharing.
    pub fn with_start_from(mut self, start_from: OffsetReset) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.start_from = start_from;
        }
        self
    }

    /// Append a value at the next offset of `partition`, returning the offset.
    pub fn append(
        &self,
        partition: i32,
        key: Option<&[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<i64> {
        let offset = {
            let mut partitions = self.inner.partitions.write();
            let records = partitions
                .get_mut(&partition)
                .ok_or_else(|| self.unknown(partition))?;
            let offset = records.last().map(|r| r.offset() + 1).unwrap_or(0);
            let mut record = Record::new(partition, offset, value)
                .with_timestamp(chrono::Utc::now().timestamp_millis());
            if let Some(key) = key {
                record = record.with_key(key);
            }
            records.push(record);
            offset
        };
        self.notify();
        Ok(offset)
    }

    /// Append a record at its own offset, which must be past the current end.
    pub fn push(&self, record: Record) -> Result<()> {
        {
            let mut partitions = self.inner.partitions.write();
            let partition = record.partition();
            let records = partitions
                .get_mut(&partition)
                .ok_or_else(|| self.unknown(partition))?;
            if let Some(last) = records.last() {
                if record.offset() <= last.offset() {
                    return Err(Error::InvalidBatch(format!(
                        "offset {} is not past the end of partition {} ({})",
                        record.offset(),
                        partition,
                        last.offset()
                    )));
                }
            }
            records.push(record);
        }
        self.notify();
        Ok(())
    }

    /// Make the next `count` pulls on `partition` fail with a connection error.
    pub fn fail_next_pulls(&self, partition: i32, count: u32) {
        self.inner.failures.insert(partition, count);
    }

    /// Number of records stored for a partition.
    pub fn len(&self, partition: i32) -> usize {
        self.inner
            .partitions
            .read()
            .get(&partition)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, partition: i32) -> bool {
        self.len(partition) == 0
    }

    fn notify(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }

    fn unknown(&self, partition: i32) -> Error {
        ConnectionError::UnknownPartition {
            topic: self.inner.topic.clone(),
            partition,
        }
        .into()
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    fn topic(&self) -> &str {
        &self.inner.topic
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        Ok(self.inner.partitions.read().keys().copied().collect())
    }

    async fn open(&self, partition: i32) -> Result<Box<dyn PartitionReader>> {
        let position = {
            let partitions = self.inner.partitions.read();
            let records = partitions
                .get(&partition)
                .ok_or_else(|| self.unknown(partition))?;
            match self.inner.start_from {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => records.len(),
            }
        };

        Ok(Box::new(MemoryReader {
            partition,
            position,
            changes: self.inner.version.subscribe(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryReader {
    partition: i32,
    /// Index of the next record to hand out.
    position: usize,
    changes: watch::Receiver<u64>,
    inner: Arc<Inner>,
}

impl MemoryReader {
    fn take_failure(&self) -> bool {
        match self.inner.failures.get_mut(&self.partition) {
            Some(mut left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PartitionReader for MemoryReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn pull(&mut self, max_batch_size: usize, timeout: Duration) -> Result<Batch> {
        if self.take_failure() {
            return Err(ConnectionError::Unreachable {
                broker: "memory".into(),
                message: format!("injected failure on partition {}", self.partition),
            }
            .into());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Mark seen before reading so an append in between still wakes us.
            self.changes.borrow_and_update();
            let records: Vec<Record> = {
                let partitions = self.inner.partitions.read();
                let stored = partitions.get(&self.partition).map(Vec::as_slice).unwrap_or(&[]);
                let end = (self.position + max_batch_size).min(stored.len());
                stored
                    .get(self.position..end)
                    .map(<[Record]>::to_vec)
                    .unwrap_or_default()
            };

            if !records.is_empty() {
                self.position += records.len();
                return Batch::new(self.partition, records);
            }

            match tokio::time::timeout_at(deadline, self.changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ConnectionError::Closed.into()),
                Err(_) => return Ok(Batch::empty(self.partition)),
            }
        }
    }

    async fn seek(&mut self, offset: i64) -> Result<()> {
        let partitions = self.inner.partitions.read();
        let stored = partitions.get(&self.partition).map(Vec::as_slice).unwrap_or(&[]);
        self.position = stored.partition_point(|r| r.offset() < offset);
        debug!(
            partition = self.partition,
            offset = offset,
            position = self.position,
            "Seeked memory reader"
        );
        Ok(())
    }
}
