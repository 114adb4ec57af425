//! Stream engine orchestration.
//!
//! Wires source, transform, sink and checkpoint store together and drives
//! the lifecycle:
//! - Starting: claim partitions, load checkpoints, seek readers past them
//! - Running: one worker task per partition
//! - Draining: workers finish their in-flight batch, stores are flushed

use super::assignment::{PartitionAssignment, WorkerId};
use super::state::{EngineState, StateMachine};
use super::worker::{PartitionOutcome, PartitionWorker, WorkerContext};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{CheckpointBackend, Config, FailurePolicy, TransformErrorPolicy};
use crate::health::{self, HealthCheck};
use crate::kafka::{KafkaOffsetStore, KafkaSink, KafkaSource};
use crate::metrics::StreamMetrics;
use crate::offset::OffsetTracker;
use crate::retry::Backoff;
use crate::sink::SinkConnector;
use crate::source::SourceConnector;
use crate::transform::{factory_for, TransformFactory};
use crate::{Error, Result};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Processing knobs shared by all partition workers.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum records per pulled batch
    pub max_batch_size: usize,
    /// How long a pull waits before returning an empty batch
    pub poll_timeout: Duration,
    /// Upper bound for a single publish attempt
    pub publish_timeout: Duration,
    /// Explicit partitions to process, all source partitions when `None`
    pub partitions: Option<Vec<i32>>,
    pub on_transform_error: TransformErrorPolicy,
    pub on_partition_failure: FailurePolicy,
    /// Retry policy for pulls and publishes
    pub backoff: Backoff,
    /// Upper bound for the final sink and checkpoint flush
    pub shutdown_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            poll_timeout: Duration::from_millis(1000),
            publish_timeout: Duration::from_millis(5000),
            partitions: None,
            on_transform_error: TransformErrorPolicy::Skip,
            on_partition_failure: FailurePolicy::Isolate,
            backoff: Backoff::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        let stream = &config.stream;
        Self {
            max_batch_size: stream.max_batch_size,
            poll_timeout: Duration::from_millis(stream.poll_timeout_ms),
            publish_timeout: Duration::from_millis(stream.publish_timeout_ms),
            partitions: stream.partitions.clone(),
            on_transform_error: stream.on_transform_error,
            on_partition_failure: stream.on_partition_failure,
            backoff: Backoff::from(&config.retry),
            ..Self::default()
        }
    }
}

/// Requests a graceful drain of a running engine.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Ask the engine to drain and stop. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }
}

/// Summary returned by [`StreamEngine::run`].
#[derive(Debug)]
pub struct EngineReport {
    /// Outcome per partition
    pub partitions: BTreeMap<i32, PartitionOutcome>,
    /// Time spent between start and stop
    pub elapsed: Duration,
}

impl EngineReport {
    /// Last committed offset for `partition`.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|o| o.committed)
    }

    /// Partitions whose worker stopped on a fatal error.
    pub fn failures(&self) -> impl Iterator<Item = &PartitionOutcome> {
        self.partitions.values().filter(|o| o.is_failed())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// First fatal error by partition order.
    pub fn first_error(&self) -> Option<&Error> {
        self.failures().find_map(|o| o.error.as_ref())
    }

    pub fn records_in(&self) -> u64 {
        self.partitions.values().map(|o| o.records_in).sum()
    }

    pub fn records_out(&self) -> u64 {
        self.partitions.values().map(|o| o.records_out).sum()
    }

    pub fn records_skipped(&self) -> u64 {
        self.partitions.values().map(|o| o.records_skipped).sum()
    }
}

/// Topic-to-topic processing engine.
pub struct StreamEngine {
    source: Arc<dyn SourceConnector>,
    sink: Arc<dyn SinkConnector>,
    transforms: Arc<dyn TransformFactory>,
    checkpoint: Arc<dyn CheckpointStore>,
    settings: Arc<EngineSettings>,
    state: StateMachine,
    assignment: Arc<PartitionAssignment>,
    tracker: Arc<OffsetTracker>,
    metrics: Arc<StreamMetrics>,
    health: Arc<HealthCheck>,
    shutdown: CancellationToken,
}

impl StreamEngine {
    pub fn builder() -> StreamEngineBuilder {
        StreamEngineBuilder::default()
    }

    /// Build an engine against the configured broker: Kafka source and sink,
    /// the configured transform and checkpoint backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let stream = &config.stream;

        let source = KafkaSource::new(
            &config.broker,
            &stream.input_topic,
            &stream.group_id,
            stream.start_from,
        )?;
        let sink = KafkaSink::new(
            &config.broker,
            &stream.output_topic,
            stream.output_partitioning,
            Duration::from_millis(stream.publish_timeout_ms),
        )?;

        let builder = StreamEngine::builder()
            .source(source)
            .sink(sink)
            .transform_factory(factory_for(stream.transform))
            .settings(EngineSettings::from(config));

        let builder = match config.checkpoint.backend {
            CheckpointBackend::File => builder.checkpoint(FileCheckpointStore::open(
                &config.checkpoint,
                &stream.group_id,
            )?),
            CheckpointBackend::Broker => builder.checkpoint(KafkaOffsetStore::new(
                &config.broker,
                &stream.input_topic,
                &stream.group_id,
            )?),
        };

        info!(
            input_topic = %stream.input_topic,
            output_topic = %stream.output_topic,
            group_id = %stream.group_id,
            transform = ?stream.transform,
            checkpoint_backend = ?config.checkpoint.backend,
            "Stream engine configured"
        );
        builder.build()
    }

    /// Run until shutdown is requested or every partition worker stopped.
    ///
    /// With [`FailurePolicy::FailFast`] the first fatal partition error
    /// drains the engine and is returned as the error. Otherwise failures are
    /// reported per partition in the [`EngineReport`].
    pub async fn run(&self) -> Result<EngineReport> {
        self.state.begin()?;
        let started = Instant::now();
        self.health.job_started();
        info!("Stream engine starting");

        let workers = match self.start().await {
            Ok(workers) => workers,
            Err(e) => {
                error!(error = %e, "Stream engine failed to start");
                for partition in self.assignment.partitions() {
                    if let Some(owner) = self.assignment.owner(partition) {
                        self.assignment.release(partition, owner);
                    }
                }
                self.health.job_completed();
                self.state.transition(EngineState::Stopped)?;
                return Err(e);
            }
        };

        self.state.transition(EngineState::Running)?;
        info!(partitions = workers.len(), "Stream engine running");

        let mut tasks = JoinSet::new();
        for (worker_id, worker) in workers {
            let partition = worker.partition();
            let assignment = Arc::clone(&self.assignment);
            tasks.spawn(async move {
                let outcome = match AssertUnwindSafe(worker.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let mut outcome = PartitionOutcome::new(partition, None);
                        outcome.error = Some(Error::at(
                            partition,
                            None,
                            Error::InvalidState("partition worker panicked".into()),
                        ));
                        outcome
                    }
                };
                assignment.release(partition, worker_id);
                outcome
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut fatal: Option<i32> = None;
        let mut draining = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled(), if !draining => {
                    draining = true;
                    self.state.transition(EngineState::Draining)?;
                    info!("Shutdown signal received, draining partition workers");
                }

                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(mut outcome)) => {
                        if outcome.committed.is_none() {
                            outcome.committed = self.tracker.committed(outcome.partition);
                        }
                        if outcome.is_failed()
                            && fatal.is_none()
                            && self.settings.on_partition_failure == FailurePolicy::FailFast
                        {
                            error!(
                                partition = outcome.partition,
                                "Partition failed with fail-fast policy, stopping engine"
                            );
                            fatal = Some(outcome.partition);
                            self.shutdown.cancel();
                        }
                        outcomes.insert(outcome.partition, outcome);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Partition worker task aborted");
                    }
                },
            }
        }

        if !draining {
            self.state.transition(EngineState::Draining)?;
            info!("All partition workers stopped, draining");
        }

        let flushed = self.drain().await;
        self.health.job_completed();
        self.state.transition(EngineState::Stopped)?;

        let mut report = EngineReport {
            partitions: outcomes,
            elapsed: started.elapsed(),
        };
        info!(
            records_in = report.records_in(),
            records_out = report.records_out(),
            records_skipped = report.records_skipped(),
            failed_partitions = report.failures().count(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Stream engine stopped"
        );

        flushed?;
        if let Some(partition) = fatal {
            if let Some(err) = report
                .partitions
                .get_mut(&partition)
                .and_then(|o| o.error.take())
            {
                return Err(err);
            }
        }
        Ok(report)
    }

    /// Claim partitions, load checkpoints and position readers.
    async fn start(&self) -> Result<Vec<(WorkerId, PartitionWorker)>> {
        for component in [health::SOURCE, health::SINK, health::CHECKPOINT] {
            self.health.register_component(component);
        }

        let partitions = match &self.settings.partitions {
            Some(partitions) => partitions.clone(),
            None => {
                let mut partitions = self.source.partitions().await?;
                partitions.sort_unstable();
                partitions.dedup();
                partitions
            }
        };
        if partitions.is_empty() {
            return Err(Error::Config(format!(
                "no partitions to process on topic {}",
                self.source.topic()
            )));
        }
        self.health.mark_healthy(health::SOURCE);

        let ctx = WorkerContext {
            sink: Arc::clone(&self.sink),
            checkpoint: Arc::clone(&self.checkpoint),
            tracker: Arc::clone(&self.tracker),
            metrics: Arc::clone(&self.metrics),
            health: Arc::clone(&self.health),
            settings: Arc::clone(&self.settings),
            cancel: self.shutdown.clone(),
        };

        let mut workers = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let worker_id = self.assignment.claim(partition)?;

            let committed = self
                .checkpoint
                .load(partition)
                .await
                .map_err(|e| Error::at(partition, None, e))?;
            self.health.mark_healthy(health::CHECKPOINT);

            let mut reader = self
                .source
                .open(partition)
                .await
                .map_err(|e| Error::at(partition, None, e))?;

            match committed {
                Some(offset) => {
                    reader
                        .seek(offset + 1)
                        .await
                        .map_err(|e| Error::at(partition, Some(offset + 1), e))?;
                    self.tracker.restore(partition, offset);
                    info!(
                        partition = partition,
                        committed = offset,
                        resume_from = offset + 1,
                        "Resuming partition from checkpoint"
                    );
                }
                None => {
                    info!(partition = partition, "No checkpoint, starting from reset position");
                }
            }

            let transform = self.transforms.create(partition);
            workers.push((
                worker_id,
                PartitionWorker::new(reader, transform, committed, ctx.clone()),
            ));
        }

        self.health.mark_healthy(health::SINK);
        Ok(workers)
    }

    /// Final flush of sink and checkpoint store, bounded by the shutdown
    /// timeout.
    async fn drain(&self) -> Result<()> {
        let flush = async {
            if let Err(e) = self.sink.flush().await {
                warn!(error = %e, "Sink flush failed during drain");
                self.health
                    .mark_degraded(health::SINK, &format!("Flush failed: {}", e));
            }
            self.checkpoint.flush().await.map_err(|e| {
                error!(error = %e, "Checkpoint flush failed during drain");
                self.health
                    .mark_unhealthy(health::CHECKPOINT, &format!("Flush failed: {}", e));
                e
            })
        };

        match tokio::time::timeout(self.settings.shutdown_timeout, flush).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                    "Drain timeout exceeded, stopping without final flush"
                );
                Ok(())
            }
        }
    }

    /// Handle for requesting a graceful drain.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Watch lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> EngineState {
        self.state.current()
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> Arc<HealthCheck> {
        Arc::clone(&self.health)
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub fn offsets(&self) -> &OffsetTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

/// Builder for [`StreamEngine`].
#[derive(Default)]
pub struct StreamEngineBuilder {
    source: Option<Arc<dyn SourceConnector>>,
    sink: Option<Arc<dyn SinkConnector>>,
    transforms: Option<Arc<dyn TransformFactory>>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    settings: EngineSettings,
    metrics: Option<Arc<StreamMetrics>>,
    health: Option<Arc<HealthCheck>>,
}

impl StreamEngineBuilder {
    pub fn source(mut self, source: impl SourceConnector + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn sink(mut self, sink: impl SinkConnector + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Transform factory; any `Fn(i32) -> Box<dyn Transform>` works.
    pub fn transform(mut self, factory: impl TransformFactory + 'static) -> Self {
        self.transforms = Some(Arc::new(factory));
        self
    }

    pub fn transform_factory(mut self, factory: Arc<dyn TransformFactory>) -> Self {
        self.transforms = Some(factory);
        self
    }

    pub fn checkpoint(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.checkpoint = Some(Arc::new(store));
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share metrics with an existing registry (e.g. an HTTP exporter).
    pub fn metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<StreamEngine> {
        let source = self
            .source
            .ok_or_else(|| Error::Config("stream engine requires a source".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| Error::Config("stream engine requires a sink".into()))?;
        let transforms = self
            .transforms
            .ok_or_else(|| Error::Config("stream engine requires a transform".into()))?;
        let checkpoint = self
            .checkpoint
            .ok_or_else(|| Error::Config("stream engine requires a checkpoint store".into()))?;

        if self.settings.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be > 0".into()));
        }

        Ok(StreamEngine {
            source,
            sink,
            transforms,
            checkpoint,
            settings: Arc::new(self.settings),
            state: StateMachine::new(),
            assignment: Arc::new(PartitionAssignment::new()),
            tracker: Arc::new(OffsetTracker::new()),
            metrics: self.metrics.unwrap_or_default(),
            health: self.health.unwrap_or_default(),
            shutdown: CancellationToken::new(),
        })
    }
}
