//! t2t Core - topic-to-topic stream transformation engine
//!
//! Consumes records from an input topic, runs each through a transform and
//! publishes the results to an output topic with:
//!
//! - One worker per input partition, strict offset order within a partition
//! - At-least-once delivery via process-then-commit checkpointing
//! - Bounded exponential backoff for broker and publish failures
//! - Durable, monotonic offset checkpoints (local log or broker group offsets)

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod offset;
pub mod record;
pub mod retry;
pub mod sink;
pub mod source;
pub mod transform;

// Re-export commonly used types
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::Config;
pub use engine::{EngineReport, EngineSettings, EngineState, ShutdownHandle, StreamEngine};
pub use error::{CheckpointError, ConnectionError, PublishError, TransformError};
pub use error::{Error, ErrorKind, Result};
pub use record::{Batch, Record};
pub use sink::{Acknowledgment, MemorySink, SinkConnector};
pub use source::{MemorySource, PartitionReader, SourceConnector};
pub use transform::{Transform, TransformFactory};
