//! Processing engine: lifecycle, partition ownership and per-partition
//! workers.

mod assignment;
mod processor;
mod state;
mod worker;

pub use assignment::{PartitionAssignment, WorkerId};
pub use processor::{
    EngineReport, EngineSettings, ShutdownHandle, StreamEngine, StreamEngineBuilder,
};
pub use state::EngineState;
pub use worker::PartitionOutcome;
