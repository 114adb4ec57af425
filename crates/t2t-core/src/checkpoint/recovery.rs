//! Rebuilding committed offsets from checkpoint log segments.
//!
//! Segments are replayed oldest first. A line that fails to parse is only
//! tolerated when it is the last line of its segment, which is what a crash
//! in the middle of an append leaves behind.

use super::entries::CheckpointEntry;
use crate::error::CheckpointError;
use crate::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SEGMENT_PREFIX: &str = "checkpoint-";
const SEGMENT_EXTENSION: &str = "jsonl";

/// Offsets rebuilt from the log, plus what replay saw on the way.
#[derive(Debug, Default)]
pub struct RecoveredCheckpoints {
    /// Highest committed offset per partition
    pub offsets: BTreeMap<i32, i64>,

    /// Segments replayed, oldest first, with their sequence numbers
    pub segments: Vec<(u64, PathBuf)>,

    /// Entries successfully replayed
    pub entries_replayed: u64,

    /// Truncated trailing lines skipped
    pub torn_lines: u64,
}

impl RecoveredCheckpoints {
    /// Sequence number of the newest segment.
    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|(seq, _)| *seq)
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// File name for a segment sequence number.
pub(crate) fn segment_name(sequence: u64) -> String {
    format!("{}{:020}.{}", SEGMENT_PREFIX, sequence, SEGMENT_EXTENSION)
}

fn parse_sequence(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}

/// Segments in `dir`, oldest first. A missing directory has no segments.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)
        .map_err(|e| {
            CheckpointError::ReadFailed(format!(
                "Failed to read checkpoint directory {}: {}",
                dir.display(),
                e
            ))
        })?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            parse_sequence(&path).map(|seq| (seq, path))
        })
        .collect();

    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Replay every segment in `dir`.
pub fn replay(dir: &Path) -> Result<RecoveredCheckpoints> {
    let mut recovered = RecoveredCheckpoints {
        segments: list_segments(dir)?,
        ..Default::default()
    };

    for (_, path) in &recovered.segments {
        let bytes = fs::read(path).map_err(|e| {
            CheckpointError::ReadFailed(format!(
                "Failed to read segment {}: {}",
                path.display(),
                e
            ))
        })?;
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();
        let last_line = lines.iter().rposition(|l| !l.trim().is_empty());

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<CheckpointEntry>(line) {
                Ok(entry) => {
                    entry.apply_to(&mut recovered.offsets);
                    recovered.entries_replayed += 1;
                }
                Err(e) if Some(index) == last_line => {
                    warn!(
                        segment = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Ignoring truncated trailing checkpoint entry"
                    );
                    recovered.torn_lines += 1;
                }
                Err(e) => {
                    return Err(CheckpointError::Corrupted {
                        segment: path.display().to_string(),
                        line: index as u64 + 1,
                        message: format!("JSON parse error: {}", e),
                    }
                    .into());
                }
            }
        }

        debug!(segment = %path.display(), lines = lines.len(), "Replayed checkpoint segment");
    }

    info!(
        dir = %dir.display(),
        segments = recovered.segments.len(),
        entries = recovered.entries_replayed,
        partitions = recovered.offsets.len(),
        "Recovered checkpoints"
    );

    Ok(recovered)
}
