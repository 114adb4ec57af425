//! Per-partition processing loop.
//!
//! pull -> transform -> publish -> commit, one batch at a time. The next
//! batch is only pulled after the previous one's commit completed, so the
//! committed offset never runs ahead of what the sink acknowledged.

use super::EngineSettings;
use crate::checkpoint::CheckpointStore;
use crate::config::TransformErrorPolicy;
use crate::error::{PublishError, TransformError};
use crate::health::{self, HealthCheck};
use crate::metrics::StreamMetrics;
use crate::offset::OffsetTracker;
use crate::record::{Batch, Record};
use crate::retry::RetryOutcome;
use crate::sink::{Acknowledgment, SinkConnector};
use crate::source::PartitionReader;
use crate::transform::Transform;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a partition worker's lifetime.
#[derive(Debug)]
pub struct PartitionOutcome {
    pub partition: i32,
    /// Last committed offset when the worker stopped
    pub committed: Option<i64>,
    pub records_in: u64,
    pub records_out: u64,
    pub records_skipped: u64,
    pub batches: u64,
    /// Fatal error that stopped the worker, if any
    pub error: Option<Error>,
}

impl PartitionOutcome {
    pub(crate) fn new(partition: i32, committed: Option<i64>) -> Self {
        Self {
            partition,
            committed,
            records_in: 0,
            records_out: 0,
            records_skipped: 0,
            batches: 0,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Components shared by all workers of an engine.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub sink: Arc<dyn SinkConnector>,
    pub checkpoint: Arc<dyn CheckpointStore>,
    pub tracker: Arc<OffsetTracker>,
    pub metrics: Arc<StreamMetrics>,
    pub health: Arc<HealthCheck>,
    pub settings: Arc<EngineSettings>,
    pub cancel: CancellationToken,
}

enum Step {
    Continue,
    Stop,
}

/// Sole owner of one partition's read cursor and transform instance.
pub(crate) struct PartitionWorker {
    partition: i32,
    reader: Box<dyn PartitionReader>,
    transform: Box<dyn Transform>,
    ctx: WorkerContext,
    /// Last committed input offset
    committed: Option<i64>,
    /// First input offset not yet committed, when known
    next_offset: Option<i64>,
    component: String,
    outcome: PartitionOutcome,
}

impl PartitionWorker {
    pub(crate) fn new(
        reader: Box<dyn PartitionReader>,
        transform: Box<dyn Transform>,
        committed: Option<i64>,
        ctx: WorkerContext,
    ) -> Self {
        let partition = reader.partition();
        Self {
            partition,
            reader,
            transform,
            ctx,
            committed,
            next_offset: committed.map(|c| c + 1),
            component: health::partition_component(partition),
            outcome: PartitionOutcome::new(partition, committed),
        }
    }

    pub(crate) fn partition(&self) -> i32 {
        self.partition
    }

    /// Process batches until cancelled or a fatal error.
    pub(crate) async fn run(mut self) -> PartitionOutcome {
        self.ctx.metrics.partition_started();
        self.ctx.health.mark_healthy(&self.component);
        info!(
            partition = self.partition,
            committed = ?self.committed,
            transform = self.transform.name(),
            "Partition worker started"
        );

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }

            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(e) => {
                    error!(
                        partition = self.partition,
                        offset = ?self.next_offset,
                        error = %e,
                        "Partition worker failed"
                    );
                    self.ctx
                        .health
                        .mark_unhealthy(&self.component, &e.to_string());
                    self.ctx.metrics.record_partition_failure(e.kind());
                    self.outcome.error = Some(e);
                    break;
                }
            }
        }

        if self.outcome.error.is_none() {
            self.ctx.health.remove_component(&self.component);
        }
        self.ctx.metrics.partition_stopped(self.partition);
        self.outcome.committed = self.committed;

        info!(
            partition = self.partition,
            committed = ?self.committed,
            records_in = self.outcome.records_in,
            records_out = self.outcome.records_out,
            records_skipped = self.outcome.records_skipped,
            "Partition worker stopped"
        );
        self.outcome
    }

    async fn step(&mut self) -> Result<Step> {
        let batch = match self.pull().await? {
            Some(batch) => batch,
            None => return Ok(Step::Stop),
        };
        if batch.is_empty() {
            return Ok(Step::Continue);
        }

        let started = Instant::now();
        let (first, last) = match (batch.first_offset(), batch.last_offset()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(Step::Continue),
        };
        self.ctx.tracker.mark_pulled(self.partition, last);
        self.ctx.metrics.record_records_in(batch.len() as u64);
        self.outcome.records_in += batch.len() as u64;

        if self.next_offset.is_none() {
            self.next_offset = Some(first);
        }

        // Everything already committed: a redelivery, nothing to do.
        if self.committed.is_some_and(|c| last <= c) {
            self.ctx.metrics.record_redelivered(batch.len() as u64);
            debug!(
                partition = self.partition,
                first_offset = first,
                last_offset = last,
                "Dropping redelivered batch"
            );
            return Ok(Step::Continue);
        }

        let outputs = self.transform_batch(&batch)?;

        let ack = match publish(&self.ctx, self.partition, &outputs).await {
            Ok(Some(ack)) => ack,
            // Cancelled while backing off: leave uncommitted, replayed on restart.
            Ok(None) => {
                info!(
                    partition = self.partition,
                    first_offset = first,
                    "Abandoning unpublished batch on shutdown"
                );
                return Ok(Step::Stop);
            }
            Err(e) => return Err(Error::at(self.partition, self.next_offset, e)),
        };

        self.ctx.tracker.mark_delivered(self.partition, last);
        self.ctx.metrics.record_records_out(ack.records as u64);
        self.outcome.records_out += ack.records as u64;

        self.commit(last).await?;

        self.outcome.batches += 1;
        self.ctx.metrics.record_batch(started.elapsed());
        debug!(
            partition = self.partition,
            first_offset = first,
            last_offset = last,
            outputs = outputs.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch committed"
        );

        Ok(Step::Continue)
    }

    /// Pull the next batch, retrying connection errors. `None` on shutdown.
    async fn pull(&mut self) -> Result<Option<Batch>> {
        let settings = Arc::clone(&self.ctx.settings);
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Ok(None),
                result = self.reader.pull(settings.max_batch_size, settings.poll_timeout) => result,
            };

            match result {
                Ok(batch) => {
                    if attempt > 0 {
                        self.ctx.health.mark_healthy(health::SOURCE);
                    }
                    if batch.partition() != self.partition {
                        return Err(Error::at(
                            self.partition,
                            self.next_offset,
                            Error::InvalidBatch(format!(
                                "reader for partition {} returned a batch for partition {}",
                                self.partition,
                                batch.partition()
                            )),
                        ));
                    }
                    return Ok(Some(batch));
                }
                Err(e) if settings.backoff.should_retry(&e, attempt) => {
                    self.ctx.metrics.record_pull_retry();
                    self.ctx
                        .health
                        .mark_degraded(health::SOURCE, &format!("Pull retrying: {}", e));
                    if !settings
                        .backoff
                        .wait("pull", self.partition, attempt, &e, &self.ctx.cancel)
                        .await
                    {
                        return Ok(None);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    self.ctx
                        .health
                        .mark_unhealthy(health::SOURCE, &format!("Pull failed: {}", e));
                    return Err(Error::at(self.partition, self.next_offset, e));
                }
            }
        }
    }

    /// Run every not-yet-committed record through the transform, in offset
    /// order.
    fn transform_batch(&mut self, batch: &Batch) -> Result<Vec<Record>> {
        let mut outputs = Vec::with_capacity(batch.len());

        for record in batch.iter() {
            if self.committed.is_some_and(|c| record.offset() <= c) {
                self.ctx.metrics.record_redelivered(1);
                continue;
            }

            match self.transform.apply(record) {
                Ok(derived) => outputs.extend(derived),
                Err(e) => self.on_transform_error(record, e)?,
            }
        }

        Ok(outputs)
    }

    fn on_transform_error(&mut self, record: &Record, err: TransformError) -> Result<()> {
        match self.ctx.settings.on_transform_error {
            TransformErrorPolicy::Skip => {
                warn!(
                    partition = self.partition,
                    offset = record.offset(),
                    transform = self.transform.name(),
                    error = %err,
                    "Skipping record rejected by transform"
                );
                self.ctx.metrics.record_transform_error(true);
                self.outcome.records_skipped += 1;
                Ok(())
            }
            TransformErrorPolicy::Fail => {
                self.ctx.metrics.record_transform_error(false);
                Err(Error::at(self.partition, Some(record.offset()), err.into()))
            }
        }
    }

    /// Durably record `offset` as processed. Checkpoint failures are fatal.
    async fn commit(&mut self, offset: i64) -> Result<()> {
        if !self.ctx.tracker.can_commit(self.partition, offset) {
            return Err(Error::at(
                self.partition,
                self.next_offset,
                Error::InvalidState(format!(
                    "commit of offset {} is ahead of the last acknowledged offset",
                    offset
                )),
            ));
        }

        if let Err(e) = self.ctx.checkpoint.commit(self.partition, offset).await {
            self.ctx
                .health
                .mark_unhealthy(health::CHECKPOINT, &format!("Commit failed: {}", e));
            return Err(Error::at(self.partition, self.next_offset, e));
        }
        self.ctx.health.mark_healthy(health::CHECKPOINT);

        self.committed = Some(offset);
        self.next_offset = Some(offset + 1);
        self.ctx.tracker.mark_committed(self.partition, offset);
        self.ctx.metrics.record_commit();
        if let Some(lag) = self.ctx.tracker.lag(self.partition) {
            self.ctx.metrics.set_lag(self.partition, lag);
        }
        Ok(())
    }
}

/// Publish with retry. `Ok(None)` when shutdown arrived during a backoff.
///
/// Takes the shared context only: the worker itself is not `Sync`.
async fn publish(
    ctx: &WorkerContext,
    partition: i32,
    outputs: &[Record],
) -> Result<Option<Acknowledgment>> {
    let settings = &ctx.settings;
    let sink = &ctx.sink;
    let health_check = &ctx.health;
    let metrics = &ctx.metrics;
    let timeout = settings.publish_timeout;

    let result = settings
        .backoff
        .retry(
            "publish",
            partition,
            &ctx.cancel,
            |e| {
                metrics.record_publish_retry();
                health_check.mark_degraded(health::SINK, &format!("Publish retrying: {}", e));
            },
            move || async move {
                match tokio::time::timeout(timeout, sink.publish(partition, outputs)).await {
                    Ok(result) => result,
                    Err(_) => Err(PublishError::Timeout {
                        partition,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into()),
                }
            },
        )
        .await;

    match result {
        Ok(ack) => {
            health_check.mark_healthy(health::SINK);
            Ok(Some(ack))
        }
        Err(RetryOutcome::Cancelled) => Ok(None),
        Err(RetryOutcome::Exhausted { error, attempts }) => {
            health_check.mark_unhealthy(health::SINK, &format!("Publish failed: {}", error));
            warn!(
                partition = partition,
                attempts = attempts,
                "Publish retry budget exhausted"
            );
            Err(error)
        }
    }
}
