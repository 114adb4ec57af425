//! Checkpoint log entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One line of the checkpoint log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckpointEntry {
    /// A partition advanced to `offset`
    Commit {
        /// Partition number
        partition: i32,
        /// Last fully processed offset
        offset: i64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Full state at compaction time, first entry of a fresh segment
    Snapshot {
        /// `(partition, offset)` pairs in partition order. Stored as a list
        /// because integer map keys do not survive the tagged encoding.
        offsets: Vec<(i32, i64)>,
        /// Commits written since the previous snapshot
        commits_since_last: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },
}

impl CheckpointEntry {
    pub fn commit(partition: i32, offset: i64) -> Self {
        CheckpointEntry::Commit {
            partition,
            offset,
            timestamp: Utc::now(),
        }
    }

    pub fn snapshot(offsets: BTreeMap<i32, i64>, commits_since_last: u64) -> Self {
        CheckpointEntry::Snapshot {
            offsets: offsets.into_iter().collect(),
            commits_since_last,
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of this entry.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CheckpointEntry::Commit { timestamp, .. } => *timestamp,
            CheckpointEntry::Snapshot { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, CheckpointEntry::Snapshot { .. })
    }

    /// Fold this entry into a partition -> offset map, keeping the maximum.
    pub fn apply_to(&self, offsets: &mut BTreeMap<i32, i64>) {
        let mut advance = |partition: i32, offset: i64| {
            offsets
                .entry(partition)
                .and_modify(|o| {
                    if offset > *o {
                        *o = offset;
                    }
                })
                .or_insert(offset);
        };

        match self {
            CheckpointEntry::Commit {
                partition, offset, ..
            } => advance(*partition, *offset),
            CheckpointEntry::Snapshot { offsets: snap, .. } => {
                for (partition, offset) in snap {
                    advance(*partition, *offset);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let entry = CheckpointEntry::commit(3, 42);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"Commit\""));

        let parsed: CheckpointEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_snapshot_entry_with_integer_keys() {
        let offsets: BTreeMap<i32, i64> = [(0, 10), (7, 3)].into_iter().collect();
        let entry = CheckpointEntry::snapshot(offsets.clone(), 1000);

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: CheckpointEntry = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_snapshot());
        match parsed {
            CheckpointEntry::Snapshot {
                offsets: restored,
                commits_since_last,
                ..
            } => {
                assert_eq!(restored.into_iter().collect::<BTreeMap<_, _>>(), offsets);
                assert_eq!(commits_since_last, 1000);
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[test]
    fn test_snapshot_line_parses_back() {
        let line = r#"{"type":"Snapshot","offsets":[[0,10],[7,3]],"commits_since_last":2,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let parsed: CheckpointEntry = serde_json::from_str(line).unwrap();

        let mut offsets = BTreeMap::new();
        parsed.apply_to(&mut offsets);
        assert_eq!(offsets, BTreeMap::from([(0, 10), (7, 3)]));
    }

    #[test]
    fn test_apply_keeps_maximum() {
        let mut offsets = BTreeMap::new();
        CheckpointEntry::commit(0, 10).apply_to(&mut offsets);
        CheckpointEntry::commit(0, 8).apply_to(&mut offsets);
        CheckpointEntry::snapshot([(0, 9), (1, 4)].into_iter().collect(), 2)
            .apply_to(&mut offsets);

        assert_eq!(offsets.get(&0), Some(&10));
        assert_eq!(offsets.get(&1), Some(&4));
    }
}
