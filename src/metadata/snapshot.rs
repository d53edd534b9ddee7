//! Snapshot persistence for the registry.
//!
//! One background task owns the file: it wakes on the registry's version
//! watch, serialises the current tables, writes them to a temporary file and
//! renames over `metadata.json`. At most one write is in flight; mutations
//! arriving during a write coalesce into the next wake-up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use super::registry::MetadataRegistry;
use super::types::MetadataSnapshot;

/// Loads the snapshot written by a previous run. A missing file is a fresh
/// node; a corrupt file refuses to start and is left intact for inspection.
pub fn load(path: &Path) -> Result<Option<MetadataSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => bail!(
            "metadata snapshot {} is corrupt ({e}); refusing to start, file left in place",
            path.display()
        ),
    }
}

async fn write_atomic(path: &Path, snapshot: &MetadataSnapshot) -> Result<()> {
    let raw = serde_json::to_vec_pretty(snapshot)?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, raw).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Spawns the write-behind task. Runs until the registry is dropped.
pub fn spawn_writer(registry: Arc<MetadataRegistry>, path: PathBuf) {
    let mut versions = registry.subscribe();
    tokio::spawn(async move {
        loop {
            if versions.changed().await.is_err() {
                break;
            }
            let snapshot = registry.snapshot();
            if let Err(e) = write_atomic(&path, &snapshot).await {
                tracing::warn!("snapshot write failed: {e:#}");
            } else {
                tracing::debug!("snapshot v{} persisted", snapshot.version);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::types::{now_ms, FileEntry, NodeLabel};

    #[test]
    fn missing_snapshot_is_a_fresh_node() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(&dir.path().join("metadata.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn corrupt_snapshot_refuses_to_start_and_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(load(&path).is_err());
        // The broken file must survive for manual inspection.
        assert_eq!(std::fs::read(&path).unwrap(), b"{not json");
    }

    #[tokio::test]
    async fn write_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let snapshot = MetadataSnapshot {
            version: 7,
            files: vec![FileEntry {
                name: "doc.bin".to_string(),
                size: 12,
                owner: NodeLabel(1),
                created_at: now_ms(),
                blocks: vec![],
            }],
            ..Default::default()
        };
        write_atomic(&path, &snapshot).await.unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].name, "doc.bin");
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn writer_task_persists_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let registry = Arc::new(MetadataRegistry::new(MetadataSnapshot::default()));
        spawn_writer(registry.clone(), path.clone());

        registry.upsert_node(crate::metadata::types::NodeEntry {
            label: NodeLabel(1),
            tcp_addr: "127.0.0.1:8888".parse().unwrap(),
            udp_addr: "127.0.0.1:8889".parse().unwrap(),
            capacity: 50 * 1024 * 1024,
            used: 0,
            liveness: crate::metadata::types::Liveness::Online,
            updated_at: now_ms(),
            last_seen: None,
        });

        // Give the write-behind task a moment to catch the version bump.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if path.exists() {
                break;
            }
        }
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.nodes[0].label, NodeLabel(1));
    }
}
