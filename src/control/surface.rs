//! The control surface: the operations an external UI drives.
//!
//! Transport-agnostic at this layer; `handlers.rs` maps these calls onto
//! HTTP for the dashboard. Every row type is plain data so a front-end can
//! render it without reaching into the registry.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::error::OpError;
use crate::metadata::types::NodeLabel;
use crate::node::Node;
use crate::persistence::{MAX_CAPACITY_BYTES, MIN_CAPACITY_BYTES};
use crate::placement::engine::CancelToken;

/// Where a block stands relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// This node holds the original placement.
    OriginalHere,
    /// This node holds the replica placement.
    ReplicaHere,
    /// Bytes still on this disk for a file that no longer exists; space to
    /// be reclaimed by the pending-delete sweep.
    FreeHere,
    /// Both hosts are elsewhere and currently offline.
    OfflineElsewhere,
    /// Both hosts are elsewhere and at least one is online.
    PresentElsewhere,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRow {
    pub label: String,
    pub online: bool,
    pub capacity: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRow {
    pub name: String,
    pub size: u64,
    pub owner: String,
    pub created_at: u64,
    pub retrievable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockRow {
    pub file: String,
    pub index: u32,
    pub original: Option<String>,
    pub replica: Option<String>,
    pub status: BlockStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub label: Option<String>,
    pub peer_count: usize,
    pub total_free: u64,
    pub total_used: u64,
}

pub struct ControlSurface {
    node: Arc<Node>,
}

impl ControlSurface {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self { node })
    }

    pub async fn connect(&self, peer: SocketAddr) -> Result<NodeLabel> {
        self.node.membership.connect(peer).await
    }

    pub fn list_nodes(&self) -> Vec<NodeRow> {
        let mut rows: Vec<NodeRow> = self
            .node
            .registry
            .nodes()
            .into_iter()
            .filter(|n| n.liveness != crate::metadata::types::Liveness::Gone)
            .map(|n| NodeRow {
                label: n.label.to_string(),
                online: n.liveness == crate::metadata::types::Liveness::Online,
                capacity: n.capacity,
                used: n.used,
            })
            .collect();
        rows.sort_by(|a, b| a.label.cmp(&b.label));
        rows
    }

    pub async fn upload(&self, local_path: &Path, cancel: &CancelToken) -> Result<(), OpError> {
        self.node.engine.upload(local_path, cancel).await.map(|_| ())
    }

    pub fn list_files(&self) -> Vec<FileRow> {
        let registry = &self.node.registry;
        let mut rows: Vec<FileRow> = registry
            .files()
            .into_iter()
            .map(|f| FileRow {
                retrievable: registry.is_retrievable(&f.name),
                name: f.name,
                size: f.size,
                owner: f.owner.to_string(),
                created_at: f.created_at,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn download(
        &self,
        name: &str,
        local_path: &Path,
        cancel: &CancelToken,
    ) -> Result<(), OpError> {
        self.node.engine.download(name, local_path, cancel).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), OpError> {
        self.node.engine.delete(name).await
    }

    /// All known placements plus any leftover local block files whose file
    /// is gone (those show as `free_here` until the sweep reclaims them).
    pub fn list_blocks(&self) -> Vec<BlockRow> {
        let local = self.node.local_label();
        let mut rows: Vec<BlockRow> = Vec::new();

        for block in self.node.registry.blocks() {
            let status = if Some(block.original) == local {
                BlockStatus::OriginalHere
            } else if Some(block.replica) == local {
                BlockStatus::ReplicaHere
            } else if self.node.engine.block_available(&block) {
                BlockStatus::PresentElsewhere
            } else {
                BlockStatus::OfflineElsewhere
            };
            rows.push(BlockRow {
                file: block.id.file.clone(),
                index: block.id.index,
                original: Some(block.original.to_string()),
                replica: Some(block.replica.to_string()),
                status,
            });
        }

        if let Ok(stored) = self.node.store.list() {
            for (id, _) in stored {
                if self.node.registry.block(&id).is_none() {
                    rows.push(BlockRow {
                        file: id.file,
                        index: id.index,
                        original: None,
                        replica: None,
                        status: BlockStatus::FreeHere,
                    });
                }
            }
        }

        rows.sort_by(|a, b| a.file.cmp(&b.file).then(a.index.cmp(&b.index)));
        rows
    }

    /// Capacity is only movable while alone, inside the window, and above
    /// what is already stored here.
    pub fn set_capacity(&self, bytes: u64) -> Result<(), OpError> {
        if self.node.membership.is_grouped() {
            return Err(OpError::InGroup);
        }
        if !(MIN_CAPACITY_BYTES..=MAX_CAPACITY_BYTES).contains(&bytes) {
            return Err(OpError::OutOfRange);
        }
        if bytes < self.node.store.used_bytes() {
            return Err(OpError::BelowUsed);
        }

        self.node.store.set_capacity(bytes);
        if let Err(e) = self.node.update_capacity(bytes) {
            tracing::warn!("persisting capacity change failed: {e:#}");
        }
        if let Some(label) = self.node.local_label() {
            self.node
                .registry
                .record_local_usage(label, bytes, self.node.store.used_bytes());
        }
        tracing::info!("capacity set to {bytes} bytes");
        Ok(())
    }

    pub fn status(&self) -> StatusRow {
        let label = self.node.local_label();
        let peer_count = self.node.registry.peer_count(label);
        let (total_free, total_used) = if peer_count > 0 || label.is_some() {
            self.node.registry.capacity_totals()
        } else {
            (self.node.store.free_bytes(), self.node.store.used_bytes())
        };
        StatusRow {
            label: label.map(|l| l.to_string()),
            peer_count,
            total_free,
            total_used,
        }
    }
}
