//! Kafka-backed source, sink and checkpoint store.

mod client;
mod offsets;
mod sink;
mod source;

pub use offsets::KafkaOffsetStore;
pub use sink::KafkaSink;
pub use source::KafkaSource;
