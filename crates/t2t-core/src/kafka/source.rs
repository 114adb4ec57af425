//! Source connector over Kafka partitions.
//!
//! Each opened partition gets its own `StreamConsumer` that is manually
//! assigned to exactly that partition. Nothing is committed through these
//! consumers; progress lives in the checkpoint store.

use super::client::{broker_list, consumer_config};
use crate::config::{BrokerConfig, OffsetReset};
use crate::error::ConnectionError;
use crate::record::{Batch, Record};
use crate::source::{PartitionReader, SourceConnector};
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reads an input topic, one consumer per partition.
pub struct KafkaSource {
    broker: BrokerConfig,
    topic: String,
    group_id: String,
    start_from: OffsetReset,
    metadata: Arc<BaseConsumer>,
}

impl KafkaSource {
    /// Create a source for `topic`. No connection is made until metadata or
    /// records are requested.
    pub fn new(
        broker: &BrokerConfig,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        start_from: OffsetReset,
    ) -> Result<Self> {
        let group_id = group_id.into();
        let metadata: BaseConsumer = consumer_config(broker, &group_id)
            .create()
            .map_err(|e| ConnectionError::Unreachable {
                broker: broker_list(broker),
                message: e.to_string(),
            })?;

        Ok(Self {
            broker: broker.clone(),
            topic: topic.into(),
            group_id,
            start_from,
            metadata: Arc::new(metadata),
        })
    }

    fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.connect_timeout_ms as u64)
    }
}

#[async_trait]
impl SourceConnector for KafkaSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        let consumer = Arc::clone(&self.metadata);
        let topic = self.topic.clone();
        let timeout = self.metadata_timeout();

        let fetched = tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| e.to_string())?;
            let topic_meta = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| "topic missing from metadata".to_string())?;
            if let Some(err) = topic_meta.error() {
                return Err(format!("{:?}", err));
            }
            let mut ids: Vec<i32> = topic_meta.partitions().iter().map(|p| p.id()).collect();
            ids.sort_unstable();
            Ok(ids)
        })
        .await
        .map_err(|e| Error::Connection(ConnectionError::Consumer(e.to_string())))?;

        let partitions = fetched.map_err(|message| ConnectionError::Metadata {
            topic: self.topic.clone(),
            message,
        })?;

        if partitions.is_empty() {
            return Err(ConnectionError::Metadata {
                topic: self.topic.clone(),
                message: "topic has no partitions".into(),
            }
            .into());
        }
        Ok(partitions)
    }

    async fn open(&self, partition: i32) -> Result<Box<dyn PartitionReader>> {
        if !self.partitions().await?.contains(&partition) {
            return Err(ConnectionError::UnknownPartition {
                topic: self.topic.clone(),
                partition,
            }
            .into());
        }

        let consumer: StreamConsumer = consumer_config(&self.broker, &self.group_id)
            .create()
            .map_err(|e| ConnectionError::Unreachable {
                broker: broker_list(&self.broker),
                message: e.to_string(),
            })?;

        let start = match self.start_from {
            OffsetReset::Earliest => Offset::Beginning,
            OffsetReset::Latest => Offset::End,
        };
        let mut reader = KafkaReader {
            consumer,
            topic: self.topic.clone(),
            partition,
        };
        reader.assign(start)?;

        info!(
            topic = %self.topic,
            partition = partition,
            start = ?self.start_from,
            "Kafka partition reader opened"
        );
        Ok(Box::new(reader))
    }
}

struct KafkaReader {
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
}

impl KafkaReader {
    fn assign(&mut self, offset: Offset) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, offset)
            .and_then(|_| self.consumer.assign(&tpl))
            .map_err(|e| ConnectionError::Seek {
                partition: self.partition,
                offset: offset.to_raw().unwrap_or(-1),
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn convert_message(msg: &BorrowedMessage) -> Record {
        let mut record = Record::new(
            msg.partition(),
            msg.offset(),
            msg.payload().map(|v| v.to_vec()).unwrap_or_default(),
        )
        .with_timestamp(msg.timestamp().to_millis().unwrap_or(0));
        if let Some(key) = msg.key() {
            record = record.with_key(key);
        }
        record
    }
}

#[async_trait]
impl PartitionReader for KafkaReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn pull(&mut self, max_batch_size: usize, timeout: Duration) -> Result<Batch> {
        let mut records = Vec::with_capacity(max_batch_size.min(1024));
        let deadline = tokio::time::Instant::now() + timeout;

        while records.len() < max_batch_size {
            // Return what we have as soon as the first record arrived and
            // the queue is momentarily empty.
            let remaining = if records.is_empty() {
                deadline.saturating_duration_since(tokio::time::Instant::now())
            } else {
                Duration::from_millis(1)
            };
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(msg)) => records.push(Self::convert_message(&msg)),
                Ok(Err(e)) => {
                    if records.is_empty() {
                        return Err(ConnectionError::Consumer(e.to_string()).into());
                    }
                    // Hand out what was read. The consumer error itself is not
                    // replayed; the next pull sees it only if it persists.
                    warn!(
                        partition = self.partition,
                        buffered = records.len(),
                        error = %e,
                        "Consumer error after partial batch, returning buffered records"
                    );
                    break;
                }
                Err(_) => break,
            }
        }

        debug!(
            partition = self.partition,
            records = records.len(),
            "Pulled batch from Kafka"
        );
        Batch::new(self.partition, records)
    }

    async fn seek(&mut self, offset: i64) -> Result<()> {
        self.assign(Offset::Offset(offset))?;
        debug!(partition = self.partition, offset = offset, "Kafka reader repositioned");
        Ok(())
    }
}
