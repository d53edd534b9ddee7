//! On-disk block files.
//!
//! Blocks live in a shared directory as `<filename>__<index>.blk`. The store
//! owns only the bytes of placements assigned to this node; what those bytes
//! mean is the registry's business. Used bytes are recomputed by a directory
//! scan at startup and maintained incrementally afterwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::metadata::types::BlockId;

const BLOCK_SUFFIX: &str = ".blk";

/// Result of a `put`: either the bytes landed, or this node is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    NoSpace,
}

pub struct BlockStore {
    dir: PathBuf,
    capacity: AtomicU64,
    used: AtomicU64,
    /// Serializes writers per block id; reads of distinct blocks stay
    /// concurrent.
    write_locks: DashMap<BlockId, Arc<Mutex<()>>>,
}

impl BlockStore {
    /// Opens (creating if needed) the shared directory and rebuilds the
    /// used-bytes counter from the block files found there.
    pub fn open(dir: impl Into<PathBuf>, capacity_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating storage dir {}", dir.display()))?;

        let mut used = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(BLOCK_SUFFIX) {
                used += entry.metadata()?.len();
            }
        }
        tracing::info!(
            "block store at {} ({} bytes used of {})",
            dir.display(),
            used,
            capacity_bytes
        );

        Ok(Self {
            dir,
            capacity: AtomicU64::new(capacity_bytes),
            used: AtomicU64::new(used),
            write_locks: DashMap::new(),
        })
    }

    fn block_path(&self, id: &BlockId) -> PathBuf {
        self.dir
            .join(format!("{}__{}{}", id.file, id.index, BLOCK_SUFFIX))
    }

    fn write_lock(&self, id: &BlockId) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn put(&self, id: &BlockId, data: &[u8]) -> Result<PutOutcome> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let path = self.block_path(id);
        let previous = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let len = data.len() as u64;
        let used = self.used.load(Ordering::SeqCst);
        if used.saturating_sub(previous) + len > self.capacity.load(Ordering::SeqCst) {
            return Ok(PutOutcome::NoSpace);
        }

        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing block {id}"))?;
        self.used
            .store(used.saturating_sub(previous) + len, Ordering::SeqCst);
        tracing::debug!("stored block {id} ({len} bytes)");
        Ok(PutOutcome::Stored)
    }

    pub async fn get(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.block_path(id)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading block {id}")),
        }
    }

    /// Removes the block file if present. Deleting an absent block is not an
    /// error; delete retries must stay idempotent.
    pub async fn delete(&self, id: &BlockId) -> Result<bool> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let path = self.block_path(id);
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(false),
        };
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting block {id}"))?;
        self.used.fetch_sub(len, Ordering::SeqCst);
        self.write_locks.remove(id);
        tracing::debug!("deleted block {id} ({len} bytes)");
        Ok(true)
    }

    /// Every block file currently on disk, parsed back into ids.
    pub fn list(&self) -> Result<Vec<(BlockId, u64)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(BLOCK_SUFFIX) else {
                continue;
            };
            let Some((file, index)) = stem.rsplit_once("__") else {
                continue;
            };
            let Ok(index) = index.parse::<u32>() else {
                continue;
            };
            out.push((BlockId::new(file, index), entry.metadata()?.len()));
        }
        Ok(out)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes().saturating_sub(self.used_bytes())
    }

    /// Preconditions (disconnected, range, >= used) are the control
    /// surface's job; the store just takes the new value.
    pub fn set_capacity(&self, capacity_bytes: u64) {
        self.capacity.store(capacity_bytes, Ordering::SeqCst);
    }
}
