//! Error types for t2t core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! The four domain enums map onto the failure classes the engine reacts to:
//! connection and publish failures are transient and retried with backoff,
//! transform failures follow the configured skip-or-fail policy, and
//! checkpoint failures are always fatal.

use thiserror::Error;

/// Result type alias for t2t operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for t2t.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker unreachable or consumer failure
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Bad input record
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Sink rejected or timed out
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Checkpoint store unreachable or inconsistent
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A partition worker stopped on a fatal error
    #[error(
        "Partition {partition} failed at offset {}: {source}",
        .offset.map_or_else(|| "unknown".to_string(), |o| o.to_string())
    )]
    PartitionFailed {
        partition: i32,
        offset: Option<i64>,
        #[source]
        source: Box<Error>,
    },

    /// Source handed out a batch that breaks the batch invariants
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Operation not allowed in the current engine state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Attach the partition and offset at which an error became fatal.
    pub fn at(partition: i32, offset: Option<i64>, source: Error) -> Self {
        match source {
            // Already positioned, don't nest.
            err @ Error::PartitionFailed { .. } => err,
            other => Error::PartitionFailed {
                partition,
                offset,
                source: Box::new(other),
            },
        }
    }

    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_retryable(),
            Error::Publish(_) => true,
            Error::PartitionFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Coarse classification used for metrics labels and exit codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Transform(_) => ErrorKind::Transform,
            Error::Publish(_) => ErrorKind::Publish,
            Error::Checkpoint(_) => ErrorKind::Checkpoint,
            Error::PartitionFailed { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// Error classes, one per failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Connection,
    Transform,
    Publish,
    Checkpoint,
    Other,
}

impl ErrorKind {
    /// Label value for metrics export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Connection => "connection",
            ErrorKind::Transform => "transform",
            ErrorKind::Publish => "publish",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Other => "other",
        }
    }
}

/// Source-side broker errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to reach a broker
    #[error("Connection failed to {broker}: {message}")]
    Unreachable { broker: String, message: String },

    /// Topic metadata could not be resolved
    #[error("Metadata error for topic {topic}: {message}")]
    Metadata { topic: String, message: String },

    /// Consumer reported an error while fetching
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Partition not present on the topic
    #[error("Unknown partition {partition} on topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    /// Repositioning the read cursor failed
    #[error("Seek to offset {offset} on partition {partition} failed: {message}")]
    Seek {
        partition: i32,
        offset: i64,
        message: String,
    },

    /// Consumer closed
    #[error("Consumer closed")]
    Closed,
}

impl ConnectionError {
    /// Closed consumers and missing partitions will not heal by retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::Closed | ConnectionError::UnknownPartition { .. }
        )
    }
}

/// Transform-stage errors.
#[derive(Error, Debug)]
pub enum TransformError {
    /// Input record cannot be interpreted by the transform
    #[error("Malformed record at {partition}@{offset}: {message}")]
    Malformed {
        partition: i32,
        offset: i64,
        message: String,
    },

    /// Transform-specific failure
    #[error("Transform {transform} failed: {message}")]
    Failed { transform: String, message: String },
}

/// Sink-side errors.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Broker refused the records
    #[error("Publish to partition {partition} rejected: {message}")]
    Rejected { partition: i32, message: String },

    /// No acknowledgment within the publish timeout
    #[error("Publish to partition {partition} timed out after {timeout_ms}ms")]
    Timeout { partition: i32, timeout_ms: u64 },

    /// Producer-level failure (flush, queue)
    #[error("Producer error: {0}")]
    Producer(String),
}

/// Offset checkpoint store errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Durable write failed
    #[error("Checkpoint write failed: {0}")]
    WriteFailed(String),

    /// Reading persisted checkpoints failed
    #[error("Checkpoint read failed: {0}")]
    ReadFailed(String),

    /// Persisted data cannot be parsed
    #[error("Checkpoint log corrupted in {segment} at line {line}: {message}")]
    Corrupted {
        segment: String,
        line: u64,
        message: String,
    },

    /// Commit would move a partition's checkpoint backwards
    #[error("Checkpoint regression on partition {partition}: committed {committed}, attempted {attempted}")]
    Regression {
        partition: i32,
        committed: i64,
        attempted: i64,
    },

    /// Store cannot be reached
    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let conn_err = ConnectionError::Unreachable {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = conn_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_retry_classification() {
        let publish: Error = PublishError::Timeout {
            partition: 0,
            timeout_ms: 100,
        }
        .into();
        assert!(publish.is_retryable());

        let conn: Error = ConnectionError::Consumer("broker down".into()).into();
        assert!(conn.is_retryable());

        let closed: Error = ConnectionError::Closed.into();
        assert!(!closed.is_retryable());

        let checkpoint: Error = CheckpointError::Unavailable("disk gone".into()).into();
        assert!(!checkpoint.is_retryable());

        let transform: Error = TransformError::Failed {
            transform: "uppercase".into(),
            message: "boom".into(),
        }
        .into();
        assert!(!transform.is_retryable());
    }

    #[test]
    fn test_partition_failed_carries_position() {
        let err = Error::at(
            3,
            Some(51),
            CheckpointError::WriteFailed("fsync".into()).into(),
        );
        let text = err.to_string();
        assert!(text.contains("Partition 3"));
        assert!(text.contains("offset 51"));
        assert_eq!(err.kind(), ErrorKind::Checkpoint);

        // Re-wrapping keeps the original position.
        let rewrapped = Error::at(7, None, err);
        assert!(matches!(
            rewrapped,
            Error::PartitionFailed {
                partition: 3,
                offset: Some(51),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_offset_display() {
        let err = Error::at(0, None, ConnectionError::Closed.into());
        assert!(err.to_string().contains("offset unknown"));
    }

    #[test]
    fn test_regression_display() {
        let err = CheckpointError::Regression {
            partition: 1,
            committed: 20,
            attempted: 10,
        };
        assert!(err.to_string().contains("committed 20"));
    }
}
