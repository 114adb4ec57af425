//! Record and batch types flowing through the engine.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// An immutable unit of data read from or written to a topic partition.
///
/// Derived records produced by a transform inherit the partition, offset and
/// timestamp of the record they were derived from. The offset is therefore
/// always an *input* offset, which is what the engine commits and what
/// downstream consumers can deduplicate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    partition: i32,
    offset: i64,
    timestamp: i64,
}

impl Record {
    /// Create a record with no key and a zero timestamp.
    pub fn new(partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
            partition,
            offset,
            timestamp: 0,
        }
    }

    /// Set the record key.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the record timestamp (milliseconds since epoch).
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build a derived record carrying this record's position.
    pub fn derive(&self, key: Option<Vec<u8>>, value: impl Into<Vec<u8>>) -> Record {
        Record {
            key,
            value: value.into(),
            partition: self.partition,
            offset: self.offset,
            timestamp: self.timestamp,
        }
    }

    /// Build a derived record with the same key and a new value.
    pub fn with_value(&self, value: impl Into<Vec<u8>>) -> Record {
        self.derive(self.key.clone(), value)
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Get the record key as a string.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_ref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Get the record value as a string.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Estimated size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0) + self.value.len() + 20 // partition, offset, timestamp
    }
}

/// Ordered records from a single partition with strictly increasing offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    partition: i32,
    records: Vec<Record>,
}

impl Batch {
    /// Build a batch, checking that every record belongs to `partition`
    /// and that offsets strictly increase.
    pub fn new(partition: i32, records: Vec<Record>) -> Result<Self> {
        let mut previous: Option<i64> = None;
        for record in &records {
            if record.partition != partition {
                return Err(Error::InvalidBatch(format!(
                    "record at offset {} belongs to partition {}, batch is for partition {}",
                    record.offset, record.partition, partition
                )));
            }
            if let Some(prev) = previous {
                if record.offset <= prev {
                    return Err(Error::InvalidBatch(format!(
                        "offsets not strictly increasing on partition {}: {} after {}",
                        partition, record.offset, prev
                    )));
                }
            }
            previous = Some(record.offset);
        }
        Ok(Self { partition, records })
    }

    /// An empty batch, returned by a pull that timed out.
    pub fn empty(partition: i32) -> Self {
        Self {
            partition,
            records: Vec::new(),
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Total payload size of the batch.
    pub fn size_bytes(&self) -> usize {
        self.records.iter().map(Record::size_bytes).sum()
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
