//! Subcommand implementations.

pub mod checkpoints;
pub mod run;
pub mod status;
