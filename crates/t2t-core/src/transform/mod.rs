//! Transform stage.
//!
//! A [`Transform`] maps one input record to zero or more output records.
//! Each partition worker gets its own instance from a [`TransformFactory`],
//! so any keyed state a transform keeps is scoped to a single partition.
//!
//! Outputs must be derived with [`Record::derive`] or [`Record::with_value`]
//! so they carry the input offset. Transforms never perform I/O.

mod builtin;
mod keyed;

pub use builtin::{Chain, Filter, FlatMap, Identity, Lowercase, MapValues, Uppercase};
pub use keyed::KeyedCount;

use crate::config::TransformKind;
use crate::error::TransformError;
use crate::record::Record;
use std::sync::Arc;

/// Per-record transformation.
pub trait Transform: Send {
    /// Transform one record. Must be deterministic given the record and the
    /// transform's current state.
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError>;

    /// Name used in logs and error messages.
    fn name(&self) -> &str;
}

/// Creates one transform instance per partition.
pub trait TransformFactory: Send + Sync {
    fn create(&self, partition: i32) -> Box<dyn Transform>;
}

impl<F> TransformFactory for F
where
    F: Fn(i32) -> Box<dyn Transform> + Send + Sync,
{
    fn create(&self, partition: i32) -> Box<dyn Transform> {
        self(partition)
    }
}

/// Factory for a built-in transform selected in configuration.
pub fn factory_for(kind: TransformKind) -> Arc<dyn TransformFactory> {
    match kind {
        TransformKind::Identity => Arc::new(|_: i32| -> Box<dyn Transform> { Box::new(Identity) }),
        TransformKind::Uppercase => {
            Arc::new(|_: i32| -> Box<dyn Transform> { Box::new(Uppercase) })
        }
        TransformKind::Lowercase => {
            Arc::new(|_: i32| -> Box<dyn Transform> { Box::new(Lowercase) })
        }
    }
}
