//! Append-only checkpoint log on local disk.
//!
//! Layout: `<dir>/<group_id>/checkpoint-<sequence>.jsonl`. Every commit is
//! appended as one JSON line and fsynced before `commit` returns. Every
//! `compaction_interval_entries` commits a snapshot of all partitions opens
//! a fresh segment, and segments beyond `max_segments` are deleted.

use super::entries::CheckpointEntry;
use super::recovery::{self, segment_name};
use super::{check_advance, CheckpointStore};
use crate::config::CheckpointConfig;
use crate::error::CheckpointError;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct Segment {
    sequence: u64,
    path: PathBuf,
    writer: BufWriter<File>,
}

struct State {
    segment: Segment,
    offsets: BTreeMap<i32, i64>,
    commits_since_snapshot: u64,
}

/// Durable checkpoint store backed by a JSON-lines log.
pub struct FileCheckpointStore {
    dir: PathBuf,
    compaction_interval: u64,
    max_segments: usize,
    state: Mutex<State>,
}

fn write_failed(context: &str, e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::WriteFailed(format!("{}: {}", context, e))
}

fn open_segment(dir: &Path, sequence: u64) -> Result<Segment> {
    let path = dir.join(segment_name(sequence));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| write_failed("Failed to open checkpoint segment", e))?;

    Ok(Segment {
        sequence,
        path,
        writer: BufWriter::new(file),
    })
}

fn append_durable(segment: &mut Segment, entry: &CheckpointEntry) -> Result<()> {
    let json = serde_json::to_string(entry)?;
    writeln!(segment.writer, "{}", json).map_err(|e| write_failed("Failed to append", e))?;
    segment
        .writer
        .flush()
        .map_err(|e| write_failed("Failed to flush", e))?;
    segment
        .writer
        .get_ref()
        .sync_data()
        .map_err(|e| write_failed("Failed to fsync", e))?;
    Ok(())
}

impl FileCheckpointStore {
    /// Open the store for `group_id` under `config.dir`, recovering existing
    /// segments. A new segment is always started, so a torn tail left by a
    /// crash is never appended to.
    pub fn open(config: &CheckpointConfig, group_id: &str) -> Result<Self> {
        let dir = Self::group_dir(&config.dir, group_id);
        fs::create_dir_all(&dir)
            .map_err(|e| write_failed("Failed to create checkpoint directory", e))?;

        let recovered = recovery::replay(&dir)?;
        let sequence = recovered.last_sequence().map(|s| s + 1).unwrap_or(1);
        let mut segment = open_segment(&dir, sequence)?;

        if !recovered.offsets.is_empty() {
            append_durable(
                &mut segment,
                &CheckpointEntry::snapshot(recovered.offsets.clone(), 0),
            )?;
        }

        info!(
            group_id = group_id,
            path = %segment.path.display(),
            partitions = recovered.offsets.len(),
            "Checkpoint log opened"
        );

        let store = Self {
            dir,
            compaction_interval: config.compaction_interval_entries.max(1) as u64,
            max_segments: config.max_segments.max(1),
            state: Mutex::new(State {
                segment,
                offsets: recovered.offsets,
                commits_since_snapshot: 0,
            }),
        };
        store.cleanup_old_segments()?;
        Ok(store)
    }

    /// Directory holding one group's segments.
    pub fn group_dir(base: &Path, group_id: &str) -> PathBuf {
        base.join(group_id)
    }

    /// Read a group's committed offsets without opening the store for writing.
    pub fn read_offsets(base: &Path, group_id: &str) -> Result<BTreeMap<i32, i64>> {
        Ok(recovery::replay(&Self::group_dir(base, group_id))?.offsets)
    }

    /// Path of the segment currently appended to.
    pub fn current_path(&self) -> PathBuf {
        self.state.lock().segment.path.clone()
    }

    fn compact(&self, state: &mut State) -> Result<()> {
        let mut next = open_segment(&self.dir, state.segment.sequence + 1)?;
        append_durable(
            &mut next,
            &CheckpointEntry::snapshot(state.offsets.clone(), state.commits_since_snapshot),
        )?;

        let old = std::mem::replace(&mut state.segment, next);
        debug!(
            old_path = %old.path.display(),
            new_path = %state.segment.path.display(),
            commits = state.commits_since_snapshot,
            "Checkpoint log compacted into new segment"
        );
        state.commits_since_snapshot = 0;
        drop(old);

        self.cleanup_old_segments()
    }

    fn cleanup_old_segments(&self) -> Result<()> {
        let segments = recovery::list_segments(&self.dir)?;
        let excess = segments.len().saturating_sub(self.max_segments);

        // Oldest first; the newest segment is never in the excess.
        for (_, path) in segments.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed old checkpoint segment"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove old checkpoint segment")
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, partition: i32) -> Result<Option<i64>> {
        Ok(self.state.lock().offsets.get(&partition).copied())
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        let mut state = self.state.lock();
        if !check_advance(partition, state.offsets.get(&partition).copied(), offset)? {
            return Ok(());
        }

        append_durable(
            &mut state.segment,
            &CheckpointEntry::commit(partition, offset),
        )?;
        state.offsets.insert(partition, offset);
        state.commits_since_snapshot += 1;

        // The commit is already durable; a failed rotation is retried on the next commit.
        if state.commits_since_snapshot >= self.compaction_interval {
            if let Err(e) = self.compact(&mut state) {
                warn!(
                    path = %state.segment.path.display(),
                    commits = state.commits_since_snapshot,
                    error = %e,
                    "Checkpoint compaction failed, continuing on current segment"
                );
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state
            .segment
            .writer
            .flush()
            .map_err(|e| write_failed("Failed to flush", e))?;
        state
            .segment
            .writer
            .get_ref()
            .sync_all()
            .map_err(|e| write_failed("Failed to sync", e))?;
        debug!("Checkpoint log synced to disk");
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<i32, i64>> {
        Ok(self.state.lock().offsets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &Path, interval: usize, max_segments: usize) -> CheckpointConfig {
        CheckpointConfig {
            dir: dir.to_path_buf(),
            compaction_interval_entries: interval,
            max_segments,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_commits_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 100, 4);

        {
            let store = FileCheckpointStore::open(&config, "group").unwrap();
            store.commit(0, 10).await.unwrap();
            store.commit(1, 4).await.unwrap();
            store.commit(0, 12).await.unwrap();
            // Dropped without flush: every commit was already fsynced.
        }

        let store = FileCheckpointStore::open(&config, "group").unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(12));
        assert_eq!(store.load(1).await.unwrap(), Some(4));
        assert_eq!(store.load(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 100, 4);

        let a = FileCheckpointStore::open(&config, "a").unwrap();
        let b = FileCheckpointStore::open(&config, "b").unwrap();
        a.commit(0, 99).await.unwrap();

        assert_eq!(b.load(0).await.unwrap(), None);
        assert_eq!(
            FileCheckpointStore::read_offsets(temp_dir.path(), "a")
                .unwrap()
                .get(&0),
            Some(&99)
        );
    }

    #[tokio::test]
    async fn test_regression_rejected_and_not_written() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 100, 4);
        let store = FileCheckpointStore::open(&config, "g").unwrap();

        store.commit(0, 20).await.unwrap();
        assert!(store.commit(0, 19).await.is_err());
        store.commit(0, 20).await.unwrap();

        let content = fs::read_to_string(store.current_path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_compaction_rotates_and_bounds_segments() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 3, 2);
        let store = FileCheckpointStore::open(&config, "g").unwrap();

        for offset in 0..20 {
            store.commit(offset as i32 % 2, offset).await.unwrap();
        }
        store.flush().await.unwrap();

        let dir = FileCheckpointStore::group_dir(temp_dir.path(), "g");
        let segments = recovery::list_segments(&dir).unwrap();
        assert_eq!(segments.len(), 2);

        let offsets = FileCheckpointStore::read_offsets(temp_dir.path(), "g").unwrap();
        assert_eq!(offsets.get(&0), Some(&18));
        assert_eq!(offsets.get(&1), Some(&19));
    }

    #[tokio::test]
    async fn test_reopen_after_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 2, 1);

        {
            let store = FileCheckpointStore::open(&config, "g").unwrap();
            for offset in 0..5 {
                store.commit(0, offset).await.unwrap();
                store.commit(3, offset * 10).await.unwrap();
            }
        }

        // Only snapshot segments survive with a single retained segment.
        for _ in 0..3 {
            let store = FileCheckpointStore::open(&config, "g").unwrap();
            assert_eq!(store.load(0).await.unwrap(), Some(4));
            assert_eq!(store.load(3).await.unwrap(), Some(40));
        }

        let dir = FileCheckpointStore::group_dir(temp_dir.path(), "g");
        assert_eq!(recovery::list_segments(&dir).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_commit() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 1, 4);
        let store = FileCheckpointStore::open(&config, "g").unwrap();

        // Occupy the next segment name so rotation cannot open it.
        let dir = FileCheckpointStore::group_dir(temp_dir.path(), "g");
        let blocked = dir.join(segment_name(2));
        fs::create_dir(&blocked).unwrap();

        let first = store.current_path();
        store.commit(0, 5).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(5));
        assert_eq!(store.current_path(), first);

        fs::remove_dir(&blocked).unwrap();
        store.commit(0, 6).await.unwrap();
        assert_eq!(store.current_path(), blocked);
        drop(store);

        let reopened = FileCheckpointStore::open(&config, "g").unwrap();
        assert_eq!(reopened.load(0).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_reopen_after_torn_write() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path(), 100, 4);

        let path = {
            let store = FileCheckpointStore::open(&config, "g").unwrap();
            store.commit(0, 5).await.unwrap();
            store.current_path()
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"type\":\"Commit\",\"partition\":0,\"off").unwrap();
        drop(file);

        let store = FileCheckpointStore::open(&config, "g").unwrap();
        assert_eq!(store.load(0).await.unwrap(), Some(5));
        assert_ne!(store.current_path(), path);

        store.commit(0, 6).await.unwrap();
        drop(store);
        let reopened = FileCheckpointStore::open(&config, "g").unwrap();
        assert_eq!(reopened.load(0).await.unwrap(), Some(6));
    }
}
