//! Stateful keyed transforms.

use super::Transform;
use crate::error::TransformError;
use crate::record::Record;
use std::collections::HashMap;

/// Running count per key, emitted as `key -> count` on every record.
///
/// State lives in the instance, which the engine creates per partition, and
/// is not checkpointed: after a restart counts start again from the
/// reprocessed records.
#[derive(Debug, Default)]
pub struct KeyedCount {
    counts: HashMap<Vec<u8>, u64>,
}

impl KeyedCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for a key.
    pub fn count(&self, key: &[u8]) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Number of distinct keys seen.
    pub fn keys(&self) -> usize {
        self.counts.len()
    }
}

impl Transform for KeyedCount {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        let key = record.key().ok_or_else(|| TransformError::Malformed {
            partition: record.partition(),
            offset: record.offset(),
            message: "keyed count requires a record key".into(),
        })?;

        let count = self.counts.entry(key.to_vec()).or_insert(0);
        *count += 1;
        Ok(vec![record.with_value(count.to_string())])
    }

    fn name(&self) -> &str {
        "keyed-count"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_key() {
        let mut counter = KeyedCount::new();
        counter.apply(&Record::new(0, 1, "x").with_key("a")).unwrap();
        counter.apply(&Record::new(0, 2, "x").with_key("b")).unwrap();
        let out = counter.apply(&Record::new(0, 3, "x").with_key("a")).unwrap();

        assert_eq!(out[0].value(), b"2");
        assert_eq!(out[0].key_str(), Some("a"));
        assert_eq!(counter.count(b"a"), 2);
        assert_eq!(counter.keys(), 2);
    }

    #[test]
    fn test_same_state_same_output() {
        let record = Record::new(0, 9, "x").with_key("k");
        let mut left = KeyedCount::new();
        let mut right = KeyedCount::new();

        assert_eq!(left.apply(&record).unwrap(), right.apply(&record).unwrap());
    }

    #[test]
    fn test_missing_key_is_malformed() {
        let mut counter = KeyedCount::new();
        assert!(matches!(
            counter.apply(&Record::new(0, 1, "x")),
            Err(TransformError::Malformed { offset: 1, .. })
        ));
    }
}
