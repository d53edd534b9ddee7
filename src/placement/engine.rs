//! Replication & placement engine.
//!
//! Drives the three file operations across the mesh. Uploads slice the file
//! into fixed blocks and ship each one to an original and a replica host on
//! distinct nodes, rolling everything back if any block cannot be placed
//! twice. Downloads walk the blocks in order, preferring the original host
//! and falling over to the replica. Deletes are best effort against both
//! hosts, with misses parked in a pending ledger and retried when the host
//! returns. The engine also owns the inbound side of the block opcodes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::OpError;
use crate::membership::service::MembershipService;
use crate::metadata::registry::MetadataRegistry;
use crate::metadata::types::{
    now_ms, BlockEntry, BlockId, FileEntry, Liveness, NodeLabel,
};
use crate::storage::blocks::{BlockStore, PutOutcome};
use crate::transport::frame::{Frame, OpCode};
use crate::transport::messages::{
    decode_ack, decode_block_get_reply, encode_block_put, AckStatus, BlockDelete, BlockGet,
    BlockGetReply, BlockPut, CapacityUpdate, FileAnnounce, FileDelete,
};
use crate::transport::tcp::{PeerPool, BLOCK_TIMEOUT, REQUEST_TIMEOUT};

/// Cooperative cancellation for uploads and downloads; checked between
/// block transfers.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PlacementEngine {
    registry: Arc<MetadataRegistry>,
    store: Arc<BlockStore>,
    pool: Arc<PeerPool>,
    membership: Arc<MembershipService>,
    block_size: u64,
    /// Deletes owed to hosts that were offline when their file went away.
    pending_deletes: DashMap<NodeLabel, Vec<BlockId>>,
    /// Announce/delete broadcasts already applied, keyed by op id.
    seen_ops: DashMap<Uuid, u64>,
}

impl PlacementEngine {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        store: Arc<BlockStore>,
        pool: Arc<PeerPool>,
        membership: Arc<MembershipService>,
        block_size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            pool,
            membership,
            block_size,
            pending_deletes: DashMap::new(),
            seen_ops: DashMap::new(),
        })
    }

    /// Spawns the pending-delete retry worker: whenever a peer comes back
    /// online, owed deletes are flushed and tombstoned leftovers collected.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let mut returns = self.membership.subscribe_returns();
        tokio::spawn(async move {
            while let Ok(label) = returns.recv().await {
                engine.flush_pending(label).await;
                engine.collect_tombstoned().await;
            }
        });
    }

    fn local_label(&self) -> Option<NodeLabel> {
        self.membership.local_label()
    }

    fn should_process(&self, op_id: Uuid) -> bool {
        if self.seen_ops.contains_key(&op_id) {
            return false;
        }
        if self.seen_ops.len() > 10_000 {
            self.seen_ops.clear();
        }
        self.seen_ops.insert(op_id, now_ms());
        true
    }

    // --- upload ---

    pub async fn upload(&self, path: &Path, cancel: &CancelToken) -> Result<FileEntry, OpError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && !n.contains(['/', '\\']))
            .ok_or_else(|| OpError::Protocol(format!("unusable file name in {}", path.display())))?
            .to_string();

        if self.registry.file(&name).is_some() || self.registry.is_tombstoned(&name) {
            return Err(OpError::DuplicateName(name));
        }

        let size = tokio::fs::metadata(path).await?.len();
        let online = self.registry.online_nodes();
        let mut planner = super::planner::Planner::from_nodes(&online);

        let needed = 2 * size;
        let available = planner.total_free();
        if planner.host_count() < 2 || available < needed {
            return Err(OpError::InsufficientCapacity { needed, available });
        }

        let local = self
            .local_label()
            .ok_or(OpError::InsufficientCapacity { needed, available: 0 })?;

        let sizes = super::planner::block_sizes(size, self.block_size);
        tracing::info!("uploading {name}: {size} bytes in {} blocks", sizes.len());

        let mut file = tokio::fs::File::open(path).await?;
        let mut placed: Vec<(NodeLabel, BlockId)> = Vec::new();
        let mut blocks: Vec<BlockEntry> = Vec::with_capacity(sizes.len());

        for (index, &block_len) in sizes.iter().enumerate() {
            if cancel.is_cancelled() {
                self.rollback(&placed).await;
                return Err(OpError::Cancelled);
            }

            let id = BlockId::new(name.clone(), index as u32);
            let mut data = vec![0u8; block_len as usize];
            if let Err(e) = file.read_exact(&mut data).await {
                self.rollback(&placed).await;
                return Err(OpError::Storage(e));
            }

            let mut failed: Vec<NodeLabel> = Vec::new();

            let original = match self
                .place_role(&mut planner, &id, &data, false, &mut failed)
                .await
            {
                Ok(label) => label,
                Err(e) => {
                    self.rollback(&placed).await;
                    return Err(e);
                }
            };
            placed.push((original, id.clone()));

            failed.push(original);
            let replica = match self
                .place_role(&mut planner, &id, &data, true, &mut failed)
                .await
            {
                Ok(label) => label,
                Err(e) => {
                    self.rollback(&placed).await;
                    return Err(e);
                }
            };
            placed.push((replica, id.clone()));

            blocks.push(BlockEntry {
                id,
                size: block_len,
                original,
                replica,
            });
        }

        let entry = FileEntry {
            name: name.clone(),
            size,
            owner: local,
            created_at: now_ms(),
            blocks: blocks.iter().map(|b| b.id.clone()).collect(),
        };
        if let Err(e) = self.registry.add_file(entry.clone(), blocks.clone()) {
            // Lost a same-name race after placement; undo our copies.
            self.rollback(&placed).await;
            return Err(e);
        }

        self.broadcast_announce(&entry, &blocks).await;
        self.spawn_usage_broadcast();
        tracing::info!("uploaded {name} ({} blocks placed twice)", blocks.len());
        Ok(entry)
    }

    /// Places one role of one block, walking the ranking until a host
    /// acknowledges. Hosts that refuse or cannot be reached land in
    /// `failed` and are never retried for this block.
    async fn place_role(
        &self,
        planner: &mut super::planner::Planner,
        id: &BlockId,
        data: &[u8],
        is_replica: bool,
        failed: &mut Vec<NodeLabel>,
    ) -> Result<NodeLabel, OpError> {
        let need = data.len() as u64;
        let mut last_err: Option<OpError> = None;

        while let Some(candidate) = planner.pick(need, failed) {
            match self.send_put(candidate, id, data, is_replica).await {
                Ok(()) => {
                    planner.commit(candidate, need);
                    return Ok(candidate);
                }
                Err(e) => {
                    tracing::warn!("placing {id} on {candidate} failed: {e}");
                    if matches!(e, OpError::PeerUnreachable(_)) {
                        self.membership.note_unreachable(candidate);
                    }
                    failed.push(candidate);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(OpError::InsufficientCapacity {
            needed: need,
            available: planner.total_free(),
        }))
    }

    async fn send_put(
        &self,
        target: NodeLabel,
        id: &BlockId,
        data: &[u8],
        is_replica: bool,
    ) -> Result<(), OpError> {
        if Some(target) == self.local_label() {
            return match self.store.put(id, data).await {
                Ok(PutOutcome::Stored) => {
                    self.record_own_usage();
                    Ok(())
                }
                Ok(PutOutcome::NoSpace) => Err(OpError::PeerUnreachable(target)),
                Err(e) => Err(OpError::Protocol(format!("local store: {e:#}"))),
            };
        }

        let addr = self
            .registry
            .node(target)
            .ok_or(OpError::PeerUnreachable(target))?
            .tcp_addr;
        let payload = encode_block_put(&BlockPut {
            id: id.clone(),
            is_replica,
            data: data.to_vec(),
        });

        let reply = self
            .request_with_retry(addr, OpCode::BlockPut, payload, BLOCK_TIMEOUT, 2)
            .await
            .map_err(|_| OpError::PeerUnreachable(target))?;
        match decode_ack(&reply.payload) {
            Ok(AckStatus::Ok) => Ok(()),
            Ok(status) => {
                tracing::debug!("{target} refused {id}: {status:?}");
                Err(OpError::PeerUnreachable(target))
            }
            Err(e) => Err(OpError::Protocol(e.to_string())),
        }
    }

    async fn rollback(&self, placed: &[(NodeLabel, BlockId)]) {
        if placed.is_empty() {
            return;
        }
        tracing::warn!("rolling back {} placements", placed.len());
        for (host, id) in placed {
            self.delete_on(*host, id).await;
        }
    }

    // --- download ---

    pub async fn download(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<(), OpError> {
        let file = self
            .registry
            .file(name)
            .ok_or_else(|| OpError::Missing(name.to_string()))?;

        match self.download_into(&file, dest, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Never leave a partial file behind.
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    async fn download_into(
        &self,
        file: &FileEntry,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<(), OpError> {
        let mut out = tokio::fs::File::create(dest).await?;

        for (index, id) in file.blocks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(OpError::Cancelled);
            }
            let entry = self
                .registry
                .block(id)
                .ok_or_else(|| OpError::Missing(id.to_string()))?;
            let data = self.fetch_block(index as u32, &entry).await?;
            out.write_all(&data).await?;
        }
        out.flush().await?;
        tracing::info!("downloaded {} to {}", file.name, dest.display());
        Ok(())
    }

    /// Original host first, replica as fallback; both offline aborts the
    /// download.
    async fn fetch_block(&self, index: u32, entry: &BlockEntry) -> Result<Vec<u8>, OpError> {
        for host in entry.hosts() {
            if !self.registry.is_online(host) {
                continue;
            }
            match self.fetch_from(host, &entry.id).await {
                Ok(Some(data)) => return Ok(data),
                Ok(None) => {
                    tracing::warn!("{host} no longer holds {}", entry.id);
                }
                Err(e) => {
                    tracing::warn!("fetching {} from {host} failed: {e}", entry.id);
                    self.membership.note_unreachable(host);
                }
            }
        }
        Err(OpError::Unavailable { index })
    }

    async fn fetch_from(&self, host: NodeLabel, id: &BlockId) -> Result<Option<Vec<u8>>> {
        if Some(host) == self.local_label() {
            return self.store.get(id).await;
        }

        let addr = self
            .registry
            .node(host)
            .ok_or_else(|| anyhow::anyhow!("unknown host {host}"))?
            .tcp_addr;
        let payload = bincode::serialize(&BlockGet { id: id.clone() })?;
        let reply = self
            .request_with_retry(addr, OpCode::BlockGet, payload, BLOCK_TIMEOUT, 2)
            .await?;
        let reply: BlockGetReply = decode_block_get_reply(&reply.payload)?;
        match reply.status {
            AckStatus::Ok => Ok(Some(reply.data)),
            _ => Ok(None),
        }
    }

    // --- delete ---

    pub async fn delete(&self, name: &str) -> Result<(), OpError> {
        let (_, blocks) = self
            .registry
            .remove_file(name)
            .ok_or_else(|| OpError::Missing(name.to_string()))?;

        for block in &blocks {
            for host in block.hosts() {
                if Some(host) == self.local_label() || self.registry.is_online(host) {
                    self.delete_on(host, &block.id).await;
                } else {
                    tracing::debug!("{host} offline, parking delete of {}", block.id);
                    self.pending_deletes
                        .entry(host)
                        .or_default()
                        .push(block.id.clone());
                }
            }
        }

        self.broadcast_delete(name).await;
        self.spawn_usage_broadcast();
        tracing::info!("deleted {name} ({} blocks)", blocks.len());
        Ok(())
    }

    /// Best-effort single-host delete; a miss goes to the pending ledger.
    async fn delete_on(&self, host: NodeLabel, id: &BlockId) {
        if Some(host) == self.local_label() {
            if let Err(e) = self.store.delete(id).await {
                tracing::warn!("local delete of {id} failed: {e:#}");
            }
            self.record_own_usage();
            return;
        }

        let Some(entry) = self.registry.node(host) else {
            return;
        };
        let Ok(payload) = bincode::serialize(&BlockDelete { id: id.clone() }) else {
            return;
        };
        match self
            .request_with_retry(entry.tcp_addr, OpCode::BlockDelete, payload, REQUEST_TIMEOUT, 2)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("BLOCK_DELETE of {id} on {host} failed: {e:#}");
                self.membership.note_unreachable(host);
                self.pending_deletes
                    .entry(host)
                    .or_default()
                    .push(id.clone());
            }
        }
    }

    async fn flush_pending(&self, host: NodeLabel) {
        let Some((_, owed)) = self.pending_deletes.remove(&host) else {
            return;
        };
        tracing::info!("retrying {} pending deletes on {host}", owed.len());
        for id in owed {
            self.delete_on(host, &id).await;
        }
    }

    /// Blocks whose pending deletes are still owed to a host.
    pub fn pending_for(&self, host: NodeLabel) -> Vec<BlockId> {
        self.pending_deletes
            .get(&host)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Drops local block files whose file was deleted while this node could
    /// not hear about it (merged in later as a tombstone).
    pub async fn collect_tombstoned(&self) {
        let stored = match self.store.list() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("storage scan failed: {e:#}");
                return;
            }
        };
        let mut removed = 0usize;
        for (id, _) in stored {
            if self.registry.is_tombstoned(&id.file) {
                let _ = self.store.delete(&id).await;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("collected {removed} blocks of deleted files");
            self.record_own_usage();
        }
    }

    // --- inbound handlers (reliable-channel dispatch) ---

    pub async fn handle_block_put(&self, msg: BlockPut) -> AckStatus {
        match self.store.put(&msg.id, &msg.data).await {
            Ok(PutOutcome::Stored) => {
                tracing::debug!(
                    "stored {} as {} ({} bytes)",
                    msg.id,
                    if msg.is_replica { "replica" } else { "original" },
                    msg.data.len()
                );
                self.record_own_usage();
                self.spawn_usage_broadcast();
                AckStatus::Ok
            }
            Ok(PutOutcome::NoSpace) => AckStatus::NoSpace,
            Err(e) => {
                tracing::error!("storing {} failed: {e:#}", msg.id);
                AckStatus::Refused
            }
        }
    }

    pub async fn handle_block_get(&self, id: &BlockId) -> BlockGetReply {
        match self.store.get(id).await {
            Ok(Some(data)) => BlockGetReply {
                status: AckStatus::Ok,
                data,
            },
            Ok(None) => BlockGetReply {
                status: AckStatus::Missing,
                data: Vec::new(),
            },
            Err(e) => {
                tracing::error!("reading {id} failed: {e:#}");
                BlockGetReply {
                    status: AckStatus::Refused,
                    data: Vec::new(),
                }
            }
        }
    }

    pub async fn handle_block_delete(&self, id: &BlockId) -> AckStatus {
        match self.store.delete(id).await {
            Ok(_) => {
                self.record_own_usage();
                self.spawn_usage_broadcast();
                AckStatus::Ok
            }
            Err(e) => {
                tracing::error!("deleting {id} failed: {e:#}");
                AckStatus::Refused
            }
        }
    }

    pub fn handle_file_announce(&self, msg: FileAnnounce) {
        if !self.should_process(msg.op_id) {
            return;
        }
        let name = msg.file.name.clone();
        match self.registry.add_file(msg.file, msg.blocks) {
            Ok(_) => tracing::info!("announced file {name}"),
            Err(e) => tracing::debug!("ignoring announce of {name}: {e}"),
        }
    }

    pub async fn handle_file_delete(&self, msg: FileDelete) {
        if !self.should_process(msg.op_id) {
            return;
        }
        let removed = self.registry.apply_remote_delete(&msg.name);
        if let Some((_, blocks)) = removed {
            for block in blocks {
                if block.hosts().iter().any(|h| Some(*h) == self.local_label()) {
                    let _ = self.store.delete(&block.id).await;
                }
            }
            self.record_own_usage();
        }
        tracing::info!("file {} deleted by remote request", msg.name);
    }

    pub fn handle_capacity_update(&self, msg: &CapacityUpdate) {
        self.registry
            .record_peer_usage(msg.label, msg.capacity, msg.used, msg.updated_at);
    }

    // --- broadcast helpers ---

    async fn broadcast_announce(&self, file: &FileEntry, blocks: &[BlockEntry]) {
        let msg = FileAnnounce {
            op_id: Uuid::new_v4(),
            file: file.clone(),
            blocks: blocks.to_vec(),
        };
        self.should_process(msg.op_id);
        let Ok(payload) = bincode::serialize(&msg) else {
            return;
        };
        self.broadcast(OpCode::FileAnnounce, payload).await;
    }

    async fn broadcast_delete(&self, name: &str) {
        let msg = FileDelete {
            op_id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.should_process(msg.op_id);
        let Ok(payload) = bincode::serialize(&msg) else {
            return;
        };
        self.broadcast(OpCode::FileDelete, payload).await;
    }

    async fn broadcast(&self, op: OpCode, payload: Vec<u8>) {
        let local = self.local_label();
        for peer in self.registry.online_nodes() {
            if Some(peer.label) == local {
                continue;
            }
            if let Err(e) = self
                .pool
                .request(peer.tcp_addr, op, payload.clone(), REQUEST_TIMEOUT)
                .await
            {
                tracing::warn!("broadcast {op:?} to {} failed: {e:#}", peer.label);
                self.membership.note_unreachable(peer.label);
            }
        }
    }

    fn record_own_usage(&self) {
        if let Some(label) = self.local_label() {
            self.registry.record_local_usage(
                label,
                self.store.capacity_bytes(),
                self.store.used_bytes(),
            );
        }
    }

    /// Pushes this node's usage to the mesh right away instead of waiting
    /// for the next heartbeat.
    fn spawn_usage_broadcast(&self) {
        let Some(label) = self.local_label() else {
            return;
        };
        let msg = CapacityUpdate {
            label,
            capacity: self.store.capacity_bytes(),
            used: self.store.used_bytes(),
            updated_at: now_ms(),
        };
        let Ok(payload) = bincode::serialize(&msg) else {
            return;
        };
        let registry = self.registry.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            for peer in registry.online_nodes() {
                if peer.label == label {
                    continue;
                }
                let _ = pool
                    .request(
                        peer.tcp_addr,
                        OpCode::CapacityUpdate,
                        payload.clone(),
                        REQUEST_TIMEOUT,
                    )
                    .await;
            }
        });
    }

    /// Bounded exponential back-off with jitter around pool requests.
    async fn request_with_retry(
        &self,
        addr: std::net::SocketAddr,
        op: OpCode,
        payload: Vec<u8>,
        timeout: Duration,
        attempts: usize,
    ) -> Result<Frame> {
        let mut delay_ms = 150u64;
        for attempt in 0..attempts {
            match self.pool.request(addr, op, payload.clone(), timeout).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(e);
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
        unreachable!("attempts is never zero")
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// True while the block still has at least one online host.
    pub fn block_available(&self, entry: &BlockEntry) -> bool {
        entry.is_available(|label| {
            self.registry
                .node(label)
                .is_some_and(|n| n.liveness == Liveness::Online)
        })
    }
}
