//! In-process sink for tests and embedding.

use super::{Acknowledgment, SinkConnector};
use crate::error::PublishError;
use crate::record::Record;
use crate::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Broker-side dedup key: producer, partition, input offset, index of the
/// output among those derived from that offset.
type DedupKey = (Uuid, i32, i64, usize);

struct Inner {
    topic: String,
    producer_id: Uuid,
    idempotent: bool,
    published: RwLock<BTreeMap<i32, Vec<Record>>>,
    seen: Mutex<HashSet<DedupKey>>,
    /// Publishes to reject before storing anything.
    reject_next: AtomicU32,
    /// Publishes to store but report as timed out (lost acknowledgment).
    lose_ack_next: AtomicU32,
    publish_calls: AtomicU64,
}

/// Collects published records per partition.
#[derive(Clone)]
pub struct MemorySink {
    inner: Arc<Inner>,
}

impl MemorySink {
    /// A sink without deduplication: retried publishes may duplicate output.
    pub fn new(topic: impl Into<String>) -> Self {
        Self::build(topic.into(), false)
    }

    /// A sink that drops records it already accepted from this producer.
    pub fn idempotent(topic: impl Into<String>) -> Self {
        Self::build(topic.into(), true)
    }

    fn build(topic: String, idempotent: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                topic,
                producer_id: Uuid::new_v4(),
                idempotent,
                published: RwLock::new(BTreeMap::new()),
                seen: Mutex::new(HashSet::new()),
                reject_next: AtomicU32::new(0),
                lose_ack_next: AtomicU32::new(0),
                publish_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.reject_next.store(count, Ordering::SeqCst);
    }

    /// Store the next `count` publishes but report them as timed out.
    pub fn lose_next_acks(&self, count: u32) {
        self.inner.lose_ack_next.store(count, Ordering::SeqCst);
    }

    /// Everything accepted for a partition, in publish order.
    pub fn published(&self, partition: i32) -> Vec<Record> {
        self.inner
            .published
            .read()
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Everything accepted, across partitions.
    pub fn all_published(&self) -> BTreeMap<i32, Vec<Record>> {
        self.inner.published.read().clone()
    }

    /// Number of publish calls, including failed ones.
    pub fn publish_calls(&self) -> u64 {
        self.inner.publish_calls.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(&self, partition: i32, records: &[Record]) -> usize {
        let mut published = self.inner.published.write();
        let out = published.entry(partition).or_default();

        if !self.inner.idempotent {
            out.extend_from_slice(records);
            return records.len();
        }

        let mut seen = self.inner.seen.lock();
        let mut index_per_offset: HashMap<i64, usize> = HashMap::new();
        let mut stored = 0;
        for record in records {
            let index = index_per_offset.entry(record.offset()).or_insert(0);
            let key = (self.inner.producer_id, partition, record.offset(), *index);
            *index += 1;
            if seen.insert(key) {
                out.push(record.clone());
                stored += 1;
            }
        }
        stored
    }
}

#[async_trait]
impl SinkConnector for MemorySink {
    fn topic(&self) -> &str {
        &self.inner.topic
    }

    async fn publish(&self, partition: i32, records: &[Record]) -> Result<Acknowledgment> {
        if records.is_empty() {
            return Ok(Acknowledgment::for_records(partition, records));
        }
        self.inner.publish_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take(&self.inner.reject_next) {
            return Err(PublishError::Rejected {
                partition,
                message: "injected rejection".into(),
            }
            .into());
        }

        let stored = self.store(partition, records);
        debug!(
            partition = partition,
            records = records.len(),
            stored = stored,
            "Stored records in memory sink"
        );

        if Self::take(&self.inner.lose_ack_next) {
            return Err(PublishError::Timeout {
                partition,
                timeout_ms: 0,
            }
            .into());
        }

        Ok(Acknowledgment::for_records(partition, records))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_idempotent(&self) -> bool {
        self.inner.idempotent
    }
}
