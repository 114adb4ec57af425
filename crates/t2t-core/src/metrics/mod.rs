//! Engine metrics.

mod prometheus;

pub use prometheus::{BatchDurationHistogram, StreamMetrics};
