//! Sink connector over an idempotent Kafka producer.

use super::client::{base_config, broker_list};
use crate::config::{BrokerConfig, OutputPartitioning};
use crate::error::{ConnectionError, PublishError};
use crate::record::Record;
use crate::sink::{Acknowledgment, SinkConnector};
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

/// Publishes to an output topic with `enable.idempotence=true` and
/// `acks=all`, so the broker deduplicates retried sends from this producer.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    partitioning: OutputPartitioning,
    publish_timeout: Duration,
}

impl KafkaSink {
    pub fn new(
        broker: &BrokerConfig,
        topic: impl Into<String>,
        partitioning: OutputPartitioning,
        publish_timeout: Duration,
    ) -> Result<Self> {
        let producer: FutureProducer = base_config(broker)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", publish_timeout.as_millis().to_string())
            .create()
            .map_err(|e| ConnectionError::Unreachable {
                broker: broker_list(broker),
                message: e.to_string(),
            })?;

        let topic = topic.into();
        info!(topic = %topic, partitioning = ?partitioning, "Kafka producer created");

        Ok(Self {
            producer,
            topic,
            partitioning,
            publish_timeout,
        })
    }

    fn rejected(partition: i32, e: KafkaError) -> crate::Error {
        PublishError::Rejected {
            partition,
            message: e.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl SinkConnector for KafkaSink {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, partition: i32, records: &[Record]) -> Result<Acknowledgment> {
        if records.is_empty() {
            return Ok(Acknowledgment::for_records(partition, records));
        }

        // Enqueue everything first so the producer can batch, then wait for
        // every delivery report.
        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            let mut out = FutureRecord::<[u8], [u8]>::to(&self.topic).payload(record.value());
            if let Some(key) = record.key() {
                out = out.key(key);
            }
            if record.timestamp() > 0 {
                out = out.timestamp(record.timestamp());
            }
            if self.partitioning == OutputPartitioning::Preserve {
                out = out.partition(partition);
            }

            let delivery = self
                .producer
                .send_result(out)
                .map_err(|(e, _)| Self::rejected(partition, e))?;
            deliveries.push(delivery);
        }

        let results = tokio::time::timeout(self.publish_timeout, join_all(deliveries))
            .await
            .map_err(|_| PublishError::Timeout {
                partition,
                timeout_ms: self.publish_timeout.as_millis() as u64,
            })?;

        for result in results {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(Self::rejected(partition, e)),
                Err(_) => {
                    return Err(PublishError::Producer("delivery future cancelled".into()).into())
                }
            }
        }

        debug!(
            partition = partition,
            records = records.len(),
            "Records acknowledged by broker"
        );
        Ok(Acknowledgment::for_records(partition, records))
    }

    async fn flush(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.publish_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| PublishError::Producer(e.to_string()))?
            .map_err(|e| PublishError::Producer(e.to_string()))?;
        Ok(())
    }

    fn is_idempotent(&self) -> bool {
        true
    }
}
