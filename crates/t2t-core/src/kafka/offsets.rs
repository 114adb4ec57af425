//! Checkpoint store backed by the broker's consumer-group offsets.
//!
//! The broker convention is to store the next offset to read, so a
//! checkpoint `n` is committed as `n + 1` and read back as `stored - 1`.

use super::client::{broker_list, consumer_config};
use crate::checkpoint::{check_advance, CheckpointStore};
use crate::config::BrokerConfig;
use crate::error::{CheckpointError, ConnectionError};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Commits checkpoints synchronously to the group coordinator.
///
/// `snapshot` only reports partitions loaded or committed by this instance.
pub struct KafkaOffsetStore {
    consumer: Arc<BaseConsumer>,
    topic: String,
    group_id: String,
    timeout: Duration,
    known: Mutex<BTreeMap<i32, i64>>,
}

impl KafkaOffsetStore {
    pub fn new(broker: &BrokerConfig, topic: impl Into<String>, group_id: &str) -> Result<Self> {
        let consumer: BaseConsumer = consumer_config(broker, group_id)
            .create()
            .map_err(|e| ConnectionError::Unreachable {
                broker: broker_list(broker),
                message: e.to_string(),
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.into(),
            group_id: group_id.to_string(),
            timeout: Duration::from_millis(broker.session_timeout_ms as u64),
            known: Mutex::new(BTreeMap::new()),
        })
    }

    async fn fetch_committed(&self, partition: i32) -> Result<Option<i64>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let timeout = self.timeout;

        let stored = tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&topic, partition);
            let committed = consumer
                .committed_offsets(tpl, timeout)
                .map_err(|e| e.to_string())?;
            Ok::<_, String>(
                committed
                    .find_partition(&topic, partition)
                    .map(|e| e.offset()),
            )
        })
        .await
        .map_err(|e| CheckpointError::ReadFailed(e.to_string()))?
        .map_err(CheckpointError::Unavailable)?;

        Ok(match stored {
            Some(Offset::Offset(next)) if next > 0 => Some(next - 1),
            _ => None,
        })
    }
}

#[async_trait]
impl CheckpointStore for KafkaOffsetStore {
    async fn load(&self, partition: i32) -> Result<Option<i64>> {
        let committed = self.fetch_committed(partition).await?;
        if let Some(offset) = committed {
            self.known.lock().insert(partition, offset);
        }
        Ok(committed)
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        let current = self.known.lock().get(&partition).copied();
        if !check_advance(partition, current, offset)? {
            return Ok(());
        }

        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))?;
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await
        .map_err(|e| CheckpointError::WriteFailed(e.to_string()))?
        .map_err(|e| CheckpointError::WriteFailed(e.to_string()))?;

        self.known.lock().insert(partition, offset);
        debug!(
            group_id = %self.group_id,
            partition = partition,
            offset = offset,
            "Checkpoint committed to broker"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<i32, i64>> {
        Ok(self.known.lock().clone())
    }
}
