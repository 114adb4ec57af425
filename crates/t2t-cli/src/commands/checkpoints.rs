//! Checkpoints command implementation.

use anyhow::Result;
use std::collections::BTreeMap;
use t2t_core::config::CheckpointBackend;
use t2t_core::{Config, FileCheckpointStore};

/// Print the committed offset of every partition in a group.
pub fn run(config: &Config, group_id: Option<&str>) -> Result<()> {
    let group_id = group_id.unwrap_or(&config.stream.group_id);

    if config.checkpoint.backend == CheckpointBackend::Broker {
        println!(
            "Checkpoints for group '{}' are stored as broker group offsets.",
            group_id
        );
        println!("Inspect them with the broker's consumer-group tooling.");
        return Ok(());
    }

    let dir = FileCheckpointStore::group_dir(&config.checkpoint.dir, group_id);
    if !dir.exists() {
        println!("No checkpoints for group '{}' in {}", group_id, dir.display());
        return Ok(());
    }

    let offsets = FileCheckpointStore::read_offsets(&config.checkpoint.dir, group_id)?;
    print!("{}", render(group_id, &offsets));
    Ok(())
}

fn render(group_id: &str, offsets: &BTreeMap<i32, i64>) -> String {
    let mut out = format!("Group: {}\n", group_id);
    if offsets.is_empty() {
        out.push_str("  (no committed offsets)\n");
        return out;
    }

    out.push_str(&format!("  {:>9}  {:>12}  {:>12}\n", "PARTITION", "COMMITTED", "RESUME AT"));
    for (partition, offset) in offsets {
        out.push_str(&format!("  {:>9}  {:>12}  {:>12}\n", partition, offset, offset + 1));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use t2t_core::config::CheckpointConfig;
    use t2t_core::CheckpointStore;
    use tempfile::TempDir;

    #[test]
    fn test_render_lists_resume_offsets() {
        let offsets = BTreeMap::from([(0, 41), (2, 7)]);
        let out = render("orders", &offsets);

        assert!(out.starts_with("Group: orders\n"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].split_whitespace().eq(["0", "41", "42"]));
        assert!(lines[3].split_whitespace().eq(["2", "7", "8"]));
    }

    #[test]
    fn test_render_empty_group() {
        let out = render("idle", &BTreeMap::new());
        assert!(out.contains("no committed offsets"));
    }

    #[tokio::test]
    async fn test_reads_file_store_offsets() {
        let dir = TempDir::new().unwrap();
        let config = CheckpointConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = FileCheckpointStore::open(&config, "g").unwrap();
        store.commit(1, 99).await.unwrap();
        store.flush().await.unwrap();
        drop(store);

        let offsets = FileCheckpointStore::read_offsets(dir.path(), "g").unwrap();
        assert_eq!(offsets.get(&1), Some(&99));
    }
}
