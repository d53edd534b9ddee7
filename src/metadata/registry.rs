//! The canonical node/file/block tables.
//!
//! Every node holds a full replica of this registry; updates are broadcast
//! and merged with last-writer-wins semantics at whole-entity level. All
//! mutations go through the mutators here, which stamp a monotonic version
//! and nudge the write-behind snapshot task. The single mutex is held only
//! for short, non-blocking table edits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::types::{
    now_ms, BlockEntry, BlockId, FileEntry, Liveness, MetadataSnapshot, NodeEntry, NodeLabel,
};
use crate::error::OpError;

struct Tables {
    version: u64,
    nodes: BTreeMap<NodeLabel, NodeEntry>,
    files: BTreeMap<String, FileEntry>,
    blocks: BTreeMap<BlockId, BlockEntry>,
    tombstones: BTreeSet<String>,
}

pub struct MetadataRegistry {
    tables: Mutex<Tables>,
    version_tx: watch::Sender<u64>,
}

impl MetadataRegistry {
    pub fn new(initial: MetadataSnapshot) -> Self {
        let tables = Tables {
            version: initial.version,
            nodes: initial
                .nodes
                .into_iter()
                .map(|n| (n.label, n))
                .collect(),
            files: initial
                .files
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect(),
            blocks: initial
                .blocks
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect(),
            tombstones: initial.tombstones.into_iter().collect(),
        };
        let (version_tx, _) = watch::channel(tables.version);
        Self {
            tables: Mutex::new(tables),
            version_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("metadata mutex poisoned")
    }

    fn bump(&self, tables: &mut Tables) -> u64 {
        tables.version += 1;
        let _ = self.version_tx.send_replace(tables.version);
        tables.version
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Receiver for the write-behind snapshot task. The watch channel
    /// coalesces bursts of mutations into a single pending notification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        let tables = self.lock();
        MetadataSnapshot {
            version: tables.version,
            nodes: tables.nodes.values().cloned().collect(),
            files: tables.files.values().cloned().collect(),
            blocks: tables.blocks.values().cloned().collect(),
            tombstones: tables.tombstones.iter().cloned().collect(),
        }
    }

    // --- node mutators ---

    /// Authoritative insert/overwrite, used for entries this node just
    /// learned first-hand (join handshake, self updates).
    pub fn upsert_node(&self, mut entry: NodeEntry) -> u64 {
        let mut tables = self.lock();
        if let Some(existing) = tables.nodes.get(&entry.label) {
            entry.last_seen = entry.last_seen.or(existing.last_seen);
        }
        tables.nodes.insert(entry.label, entry);
        self.bump(&mut tables)
    }

    pub fn mark_node(&self, label: NodeLabel, liveness: Liveness) -> Option<u64> {
        let mut tables = self.lock();
        let entry = tables.nodes.get_mut(&label)?;
        if entry.liveness == liveness {
            return Some(tables.version);
        }
        entry.liveness = liveness;
        if liveness == Liveness::Online {
            entry.last_seen = Some(Instant::now());
        }
        Some(self.bump(&mut tables))
    }

    /// Fold a heartbeat into the table. Returns `Some(true)` when the peer
    /// transitioned from offline back to online (the caller starts a
    /// metadata reconciliation on that edge), `None` for unknown senders.
    pub fn touch_heartbeat(&self, label: NodeLabel, capacity: u64, used: u64) -> Option<bool> {
        let mut tables = self.lock();
        let entry = tables.nodes.get_mut(&label)?;
        if entry.liveness == Liveness::Gone {
            return None;
        }
        let was_offline = entry.liveness == Liveness::Offline;
        entry.liveness = Liveness::Online;
        entry.last_seen = Some(Instant::now());
        entry.capacity = capacity;
        entry.used = used;
        entry.updated_at = now_ms();
        self.bump(&mut tables);
        Some(was_offline)
    }

    /// Capacity/used report over the reliable channel. Third-party data, so
    /// last-writer-wins applies: newer `updated_at` wins, higher `used`
    /// breaks exact ties.
    pub fn record_peer_usage(
        &self,
        label: NodeLabel,
        capacity: u64,
        used: u64,
        updated_at: u64,
    ) -> Option<u64> {
        let mut tables = self.lock();
        let entry = tables.nodes.get_mut(&label)?;
        if (updated_at, used) <= (entry.updated_at, entry.used) {
            return Some(tables.version);
        }
        entry.capacity = capacity;
        entry.used = used;
        entry.updated_at = updated_at;
        Some(self.bump(&mut tables))
    }

    /// Overwrite this node's own usage after a local store change.
    pub fn record_local_usage(&self, label: NodeLabel, capacity: u64, used: u64) -> u64 {
        let mut tables = self.lock();
        if let Some(entry) = tables.nodes.get_mut(&label) {
            entry.capacity = capacity;
            entry.used = used;
            entry.updated_at = now_ms();
        }
        self.bump(&mut tables)
    }

    /// Ages out peers whose heartbeats stopped. Returns the labels that just
    /// went offline.
    pub fn sweep_offline(
        &self,
        exclude: Option<NodeLabel>,
        expiry: Duration,
    ) -> Vec<NodeLabel> {
        let mut tables = self.lock();
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in tables.nodes.values_mut() {
            if Some(entry.label) == exclude || entry.liveness != Liveness::Online {
                continue;
            }
            match entry.last_seen {
                Some(seen) if now.duration_since(seen) <= expiry => {}
                // A freshly merged entry has no local observation yet; start
                // its clock now instead of declaring it dead on arrival.
                None => entry.last_seen = Some(now),
                Some(_) => {
                    entry.liveness = Liveness::Offline;
                    expired.push(entry.label);
                }
            }
        }
        if !expired.is_empty() {
            self.bump(&mut tables);
        }
        expired
    }

    /// `peer_unreachable` side notification: age the peer's `last_seen` by
    /// one heartbeat interval so repeated send failures tip the failure
    /// detector over sooner than the plain 9 s window.
    pub fn penalize(&self, label: NodeLabel, by: Duration) {
        let mut tables = self.lock();
        if let Some(entry) = tables.nodes.get_mut(&label)
            && let Some(seen) = entry.last_seen
        {
            entry.last_seen = Some(seen.checked_sub(by).unwrap_or(seen));
        }
    }

    // --- file/block mutators ---

    pub fn add_file(&self, file: FileEntry, blocks: Vec<BlockEntry>) -> Result<u64, OpError> {
        let mut tables = self.lock();
        if tables.files.contains_key(&file.name) || tables.tombstones.contains(&file.name) {
            return Err(OpError::DuplicateName(file.name));
        }
        for block in &blocks {
            if block.original == block.replica {
                return Err(OpError::Protocol(format!(
                    "block {} placed twice on {}",
                    block.id, block.original
                )));
            }
        }
        for block in blocks {
            tables.blocks.insert(block.id.clone(), block);
        }
        tables.files.insert(file.name.clone(), file);
        Ok(self.bump(&mut tables))
    }

    /// Removes the file and its blocks, leaving a tombstone. Deletes are
    /// terminal: the name can never be re-created through a merge.
    pub fn remove_file(&self, name: &str) -> Option<(FileEntry, Vec<BlockEntry>)> {
        let mut tables = self.lock();
        let file = tables.files.remove(name)?;
        let mut removed = Vec::with_capacity(file.blocks.len());
        for id in &file.blocks {
            if let Some(block) = tables.blocks.remove(id) {
                removed.push(block);
            }
        }
        tables.tombstones.insert(name.to_string());
        self.bump(&mut tables);
        Some((file, removed))
    }

    /// Remote `FILE_DELETE`: tombstones the name unconditionally (deletes
    /// are terminal even when the file was never seen here) and returns
    /// whatever was removed.
    pub fn apply_remote_delete(&self, name: &str) -> Option<(FileEntry, Vec<BlockEntry>)> {
        let mut tables = self.lock();
        let newly_tombstoned = tables.tombstones.insert(name.to_string());
        let file = tables.files.remove(name);
        let removed = match &file {
            Some(file) => file
                .blocks
                .iter()
                .filter_map(|id| tables.blocks.remove(id))
                .collect(),
            None => Vec::new(),
        };
        if newly_tombstoned || file.is_some() {
            self.bump(&mut tables);
        }
        file.map(|f| (f, removed))
    }

    /// Rewrites the placements of an existing block. `original` and
    /// `replica` must name distinct registered hosts.
    pub fn set_block_hosts(
        &self,
        id: &BlockId,
        original: NodeLabel,
        replica: NodeLabel,
    ) -> Result<u64, OpError> {
        if original == replica {
            return Err(OpError::Protocol(format!(
                "block {id} placed twice on {original}"
            )));
        }
        let mut tables = self.lock();
        if !tables.nodes.contains_key(&original) || !tables.nodes.contains_key(&replica) {
            return Err(OpError::Protocol(format!(
                "block {id} references an unregistered host"
            )));
        }
        let entry = tables
            .blocks
            .get_mut(id)
            .ok_or_else(|| OpError::Missing(id.to_string()))?;
        entry.original = original;
        entry.replica = replica;
        Ok(self.bump(&mut tables))
    }

    // --- convergence ---

    /// Fold a remote snapshot in. Tombstones are terminal, files and blocks
    /// are create-once, node entries follow last-writer-wins. Returns true
    /// when anything changed.
    pub fn merge_snapshot(&self, incoming: &MetadataSnapshot) -> bool {
        let mut tables = self.lock();
        let mut changed = false;

        for name in &incoming.tombstones {
            if tables.tombstones.insert(name.clone()) {
                changed = true;
            }
            if tables.files.remove(name).is_some() {
                changed = true;
            }
            let stale: Vec<BlockId> = tables
                .blocks
                .keys()
                .filter(|id| &id.file == name)
                .cloned()
                .collect();
            for id in stale {
                tables.blocks.remove(&id);
                changed = true;
            }
        }

        for node in &incoming.nodes {
            match tables.nodes.get_mut(&node.label) {
                Some(existing) => {
                    if (node.updated_at, node.used) > (existing.updated_at, existing.used) {
                        let last_seen = existing.last_seen;
                        *existing = node.clone();
                        // Liveness and last_seen are local observations, not
                        // replicated truth.
                        existing.last_seen = last_seen;
                        changed = true;
                    }
                }
                None => {
                    let mut entry = node.clone();
                    entry.last_seen = None;
                    tables.nodes.insert(entry.label, entry);
                    changed = true;
                }
            }
        }

        for file in &incoming.files {
            if tables.tombstones.contains(&file.name) || tables.files.contains_key(&file.name) {
                continue;
            }
            tables.files.insert(file.name.clone(), file.clone());
            changed = true;
        }

        for block in &incoming.blocks {
            if tables.tombstones.contains(&block.id.file) {
                continue;
            }
            match tables.blocks.get_mut(&block.id) {
                Some(existing) => {
                    // Create-once entries cannot normally disagree; if they
                    // do, both sides settle on the lexicographically lowest
                    // host pair so every replica converges identically.
                    if (block.original, block.replica) < (existing.original, existing.replica) {
                        existing.original = block.original;
                        existing.replica = block.replica;
                        changed = true;
                    }
                }
                None => {
                    tables.blocks.insert(block.id.clone(), block.clone());
                    changed = true;
                }
            }
        }

        if incoming.version > tables.version {
            tables.version = incoming.version;
            changed = true;
        }
        if changed {
            self.bump(&mut tables);
        }
        changed
    }

    // --- queries ---

    pub fn node(&self, label: NodeLabel) -> Option<NodeEntry> {
        self.lock().nodes.get(&label).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeEntry> {
        self.lock().nodes.values().cloned().collect()
    }

    pub fn online_nodes(&self) -> Vec<NodeEntry> {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.liveness == Liveness::Online)
            .cloned()
            .collect()
    }

    pub fn is_online(&self, label: NodeLabel) -> bool {
        self.lock()
            .nodes
            .get(&label)
            .is_some_and(|n| n.liveness == Liveness::Online)
    }

    /// Peers this node knows about, excluding itself and dissolved slots.
    pub fn peer_count(&self, local: Option<NodeLabel>) -> usize {
        self.lock()
            .nodes
            .values()
            .filter(|n| Some(n.label) != local && n.liveness != Liveness::Gone)
            .count()
    }

    /// One past the highest assigned slot; `nodo1` for an empty registry.
    pub fn next_label(&self) -> NodeLabel {
        let tables = self.lock();
        let max = tables.nodes.keys().map(|l| l.0).max().unwrap_or(0);
        NodeLabel(max + 1)
    }

    pub fn file(&self, name: &str) -> Option<FileEntry> {
        self.lock().files.get(name).cloned()
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.lock().files.values().cloned().collect()
    }

    pub fn block(&self, id: &BlockId) -> Option<BlockEntry> {
        self.lock().blocks.get(id).cloned()
    }

    pub fn blocks(&self) -> Vec<BlockEntry> {
        self.lock().blocks.values().cloned().collect()
    }

    /// Blocks of one file in stream order.
    pub fn blocks_of(&self, name: &str) -> Vec<BlockEntry> {
        let tables = self.lock();
        let Some(file) = tables.files.get(name) else {
            return Vec::new();
        };
        file.blocks
            .iter()
            .filter_map(|id| tables.blocks.get(id).cloned())
            .collect()
    }

    pub fn is_tombstoned(&self, name: &str) -> bool {
        self.lock().tombstones.contains(name)
    }

    /// A file is retrievable while every block has at least one online host.
    pub fn is_retrievable(&self, name: &str) -> bool {
        let tables = self.lock();
        let Some(file) = tables.files.get(name) else {
            return false;
        };
        file.blocks.iter().all(|id| {
            tables.blocks.get(id).is_some_and(|b| {
                b.hosts().iter().any(|h| {
                    tables
                        .nodes
                        .get(h)
                        .is_some_and(|n| n.liveness == Liveness::Online)
                })
            })
        })
    }

    /// `(total_free, total_used)` over the currently online nodes.
    pub fn capacity_totals(&self) -> (u64, u64) {
        let tables = self.lock();
        tables
            .nodes
            .values()
            .filter(|n| n.liveness == Liveness::Online)
            .fold((0, 0), |(free, used), n| (free + n.free(), used + n.used))
    }
}
