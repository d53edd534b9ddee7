//! Membership service: join handshake, heartbeats and the failure detector.
//!
//! A joining node sends `HELLO` to any known peer and receives `WELCOME`
//! with its assigned label, the peer list and a metadata snapshot; it then
//! greets every listed peer, which closes the full mesh within two round
//! trips. Liveness afterwards rides on UDP heartbeats: every node emits one
//! datagram per peer every 3 seconds and marks peers offline after 9 silent
//! seconds. Offline is soft state; with a single replica per block, nothing
//! is evicted on failure.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::metadata::registry::MetadataRegistry;
use crate::metadata::types::{now_ms, Liveness, MetadataSnapshot, NodeEntry, NodeLabel};
use crate::persistence::{self, NodeState};
use crate::storage::blocks::BlockStore;
use crate::transport::frame::OpCode;
use crate::transport::messages::{Hello, MetaSync, PeerList, Welcome};
use crate::transport::tcp::{PeerPool, REQUEST_TIMEOUT};
use crate::transport::udp::HeartbeatSocket;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const HEARTBEAT_EXPIRY: Duration = Duration::from_secs(9);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Identity {
    label: Option<NodeLabel>,
    fingerprint: Option<String>,
    /// Identity persisted by an earlier run, presented for label reclaim.
    prior: Option<NodeState>,
}

pub struct MembershipService {
    registry: Arc<MetadataRegistry>,
    store: Arc<BlockStore>,
    pool: Arc<PeerPool>,
    heartbeat: HeartbeatSocket,
    /// Advertised reliable-channel address of this node.
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    data_dir: PathBuf,
    identity: Mutex<Identity>,
    heartbeat_seq: AtomicU64,
    /// Processed rebroadcast ids; repeats of the same discovery are dropped.
    seen_ops: DashMap<Uuid, u64>,
    /// Fires the label of a peer that just came back online.
    returned_tx: broadcast::Sender<NodeLabel>,
}

impl MembershipService {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        store: Arc<BlockStore>,
        pool: Arc<PeerPool>,
        heartbeat: HeartbeatSocket,
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        let prior = persistence::load_node_state(&data_dir);
        let mut identity = Identity {
            prior: prior.clone(),
            ..Identity::default()
        };

        // The snapshot is authoritative for identity across restarts: if the
        // previous run's label is still registered, this node *is* that slot.
        if let Some(state) = prior
            && registry.node(state.label).is_some()
        {
            tracing::info!("resuming as {} from persisted state", state.label);
            identity.label = Some(state.label);
            identity.fingerprint = Some(state.group_fingerprint);
        }

        let (returned_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            registry,
            store,
            pool,
            heartbeat,
            tcp_addr,
            udp_addr,
            data_dir,
            identity: Mutex::new(identity),
            heartbeat_seq: AtomicU64::new(1),
            seen_ops: DashMap::new(),
            returned_tx,
        })
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn local_label(&self) -> Option<NodeLabel> {
        self.identity.lock().expect("identity mutex poisoned").label
    }

    fn fingerprint(&self) -> Option<String> {
        self.identity
            .lock()
            .expect("identity mutex poisoned")
            .fingerprint
            .clone()
    }

    /// "In a group" for capacity guards: some other member is online.
    pub fn is_grouped(&self) -> bool {
        let local = self.local_label();
        self.registry
            .online_nodes()
            .iter()
            .any(|n| Some(n.label) != local)
    }

    pub fn subscribe_returns(&self) -> broadcast::Receiver<NodeLabel> {
        self.returned_tx.subscribe()
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

    fn local_entry(&self, label: NodeLabel) -> NodeEntry {
        NodeEntry {
            label,
            tcp_addr: self.tcp_addr,
            udp_addr: self.udp_addr,
            capacity: self.store.capacity_bytes(),
            used: self.store.used_bytes(),
            liveness: Liveness::Online,
            updated_at: now_ms(),
            last_seen: Some(std::time::Instant::now()),
        }
    }

    // --- joining ---

    /// Joins (or forms) a group through the peer at `seed`.
    pub async fn connect(self: &Arc<Self>, seed: SocketAddr) -> Result<NodeLabel> {
        let hello = {
            let identity = self.identity.lock().expect("identity mutex poisoned");
            Hello {
                claimed_label: identity
                    .label
                    .or(identity.prior.as_ref().map(|p| p.label)),
                fingerprint: identity
                    .fingerprint
                    .clone()
                    .or(identity.prior.as_ref().map(|p| p.group_fingerprint.clone())),
                tcp_addr: self.tcp_addr,
                udp_addr: self.udp_addr,
                capacity: self.store.capacity_bytes(),
                used: self.store.used_bytes(),
            }
        };

        let reply = self
            .pool
            .request(
                seed,
                OpCode::Hello,
                bincode::serialize(&hello)?,
                REQUEST_TIMEOUT,
            )
            .await
            .with_context(|| format!("HELLO to {seed}"))?;
        if reply.op != OpCode::Welcome {
            bail!("peer {seed} answered HELLO with {:?}", reply.op);
        }
        let welcome: Welcome = bincode::deserialize(&reply.payload)?;

        self.adopt(&welcome)?;
        let label = welcome.assigned_label;
        tracing::info!("joined group as {label} via {seed}");

        // Close the mesh: greet every other peer we were told about.
        let hello = Hello {
            claimed_label: Some(label),
            fingerprint: Some(welcome.group_fingerprint.clone()),
            ..hello
        };
        for peer in &welcome.peers {
            if peer.label == label || peer.tcp_addr == seed {
                continue;
            }
            if let Err(e) = self.hello_to(peer.tcp_addr, hello.clone()).await {
                tracing::warn!("mesh HELLO to {} failed: {e:#}", peer.label);
            }
        }
        Ok(label)
    }

    fn adopt(&self, welcome: &Welcome) -> Result<()> {
        {
            let mut identity = self.identity.lock().expect("identity mutex poisoned");
            identity.label = Some(welcome.assigned_label);
            identity.fingerprint = Some(welcome.group_fingerprint.clone());
            identity.prior = None;
        }
        persistence::save_node_state(
            &self.data_dir,
            &NodeState {
                label: welcome.assigned_label,
                group_fingerprint: welcome.group_fingerprint.clone(),
            },
        )?;

        self.registry.merge_snapshot(&welcome.snapshot);
        self.registry.merge_snapshot(&MetadataSnapshot {
            version: 0,
            nodes: welcome.peers.clone(),
            ..Default::default()
        });
        // Our own entry is first-hand truth, not merged gossip.
        self.registry.upsert_node(self.local_entry(welcome.assigned_label));
        Ok(())
    }

    async fn hello_to(&self, addr: SocketAddr, hello: Hello) -> Result<()> {
        let reply = self
            .pool
            .request(
                addr,
                OpCode::Hello,
                bincode::serialize(&hello)?,
                REQUEST_TIMEOUT,
            )
            .await?;
        if reply.op != OpCode::Welcome {
            bail!("mesh HELLO answered with {:?}", reply.op);
        }
        let welcome: Welcome = bincode::deserialize(&reply.payload)?;
        self.registry.merge_snapshot(&welcome.snapshot);
        Ok(())
    }

    /// Inbound `HELLO`. Assigns (or confirms) a label and returns the
    /// `WELCOME` for it. First word of a joiner triggers a `PEER_LIST`
    /// rebroadcast, which closes the mesh within two round trips.
    pub fn handle_hello(self: &Arc<Self>, hello: &Hello) -> Result<Welcome> {
        let assigned;
        let fingerprint;
        let newly_heard;
        {
            let mut identity = self.identity.lock().expect("identity mutex poisoned");

            if identity.label.is_none() {
                // First contact of an ungrouped node: this node takes the
                // lowest free slot, mints the fingerprint, and the joiner
                // gets the next one.
                let own = self.registry.next_label();
                let fp = Uuid::new_v4().to_string();
                identity.label = Some(own);
                identity.fingerprint = Some(fp.clone());
                identity.prior = None;
                self.registry.upsert_node(self.local_entry(own));
                persistence::save_node_state(
                    &self.data_dir,
                    &NodeState {
                        label: own,
                        group_fingerprint: fp,
                    },
                )?;
                tracing::info!("formed new group as {own}");
            }

            fingerprint = identity
                .fingerprint
                .clone()
                .expect("grouped node without fingerprint");

            assigned = match self.reclaimable(hello, &fingerprint) {
                Some(label) => label,
                None => self.registry.next_label(),
            };
            newly_heard = self
                .registry
                .node(assigned)
                .is_none_or(|n| n.liveness != Liveness::Online);

            // Registered while the identity lock pins the assignment, so two
            // concurrent joiners cannot receive the same slot.
            self.registry.upsert_node(NodeEntry {
                label: assigned,
                tcp_addr: hello.tcp_addr,
                udp_addr: hello.udp_addr,
                capacity: hello.capacity,
                used: hello.used,
                liveness: Liveness::Online,
                updated_at: now_ms(),
                last_seen: Some(std::time::Instant::now()),
            });
        }

        tracing::info!(
            "{} joined via HELLO (claimed {:?})",
            assigned,
            hello.claimed_label
        );

        if newly_heard {
            let service = self.clone();
            tokio::spawn(async move {
                service.broadcast_peer_list().await;
            });
        }

        Ok(Welcome {
            assigned_label: assigned,
            group_fingerprint: fingerprint,
            peers: self.registry.nodes(),
            snapshot: self.registry.snapshot(),
        })
    }

    /// A claimed label is honored when the fingerprint matches and the slot
    /// is either offline (a reconnecting node) or registered at the same
    /// address (a mesh handshake repeat).
    fn reclaimable(&self, hello: &Hello, group_fingerprint: &str) -> Option<NodeLabel> {
        let claimed = hello.claimed_label?;
        if hello.fingerprint.as_deref() != Some(group_fingerprint) {
            return None;
        }
        let entry = self.registry.node(claimed)?;
        match entry.liveness {
            Liveness::Offline => Some(claimed),
            Liveness::Online if entry.tcp_addr == hello.tcp_addr => Some(claimed),
            _ => None,
        }
    }

    /// Inbound `PEER_LIST`: fold the entries in, greet newcomers, pass the
    /// word along once.
    pub async fn handle_peer_list(self: &Arc<Self>, msg: PeerList) {
        if !self.should_process(msg.op_id) {
            return;
        }
        let local = self.local_label();
        let known_before: Vec<NodeLabel> = self.registry.nodes().iter().map(|n| n.label).collect();

        self.registry.merge_snapshot(&MetadataSnapshot {
            version: 0,
            nodes: msg.peers.clone(),
            ..Default::default()
        });

        let Some(label) = local else { return };
        let hello = Hello {
            claimed_label: Some(label),
            fingerprint: self.fingerprint(),
            tcp_addr: self.tcp_addr,
            udp_addr: self.udp_addr,
            capacity: self.store.capacity_bytes(),
            used: self.store.used_bytes(),
        };

        let mut discovered = false;
        for peer in &msg.peers {
            if peer.label == label || known_before.contains(&peer.label) {
                continue;
            }
            discovered = true;
            tracing::info!("discovered {} via PEER_LIST", peer.label);
            if let Err(e) = self.hello_to(peer.tcp_addr, hello.clone()).await {
                tracing::warn!("mesh HELLO to {} failed: {e:#}", peer.label);
            }
        }

        if discovered {
            self.broadcast_peer_list().await;
        }
    }

    /// Tells every online peer about the current membership view.
    pub async fn broadcast_peer_list(&self) {
        let msg = PeerList {
            op_id: Uuid::new_v4(),
            peers: self.registry.nodes(),
        };
        self.should_process(msg.op_id); // never re-handle our own broadcast
        let Ok(payload) = bincode::serialize(&msg) else {
            return;
        };
        let local = self.local_label();
        for peer in self.registry.online_nodes() {
            if Some(peer.label) == local {
                continue;
            }
            if let Err(e) = self
                .pool
                .request(
                    peer.tcp_addr,
                    OpCode::PeerList,
                    payload.clone(),
                    REQUEST_TIMEOUT,
                )
                .await
            {
                tracing::warn!("PEER_LIST to {} failed: {e:#}", peer.label);
                self.note_unreachable(peer.label);
            }
        }
    }

    // --- reconciliation ---

    /// Inbound `META_SYNC`: merge theirs, answer with ours.
    pub fn handle_meta_sync(&self, msg: &MetaSync) -> MetaSync {
        self.registry.merge_snapshot(&msg.snapshot);
        MetaSync {
            snapshot: self.registry.snapshot(),
        }
    }

    /// Reconcile with one peer (used when it returns from offline).
    pub async fn meta_sync_with(&self, label: NodeLabel) -> Result<()> {
        let peer = self
            .registry
            .node(label)
            .with_context(|| format!("unknown peer {label}"))?;
        let request = MetaSync {
            snapshot: self.registry.snapshot(),
        };
        let reply = self
            .pool
            .request(
                peer.tcp_addr,
                OpCode::MetaSync,
                bincode::serialize(&request)?,
                REQUEST_TIMEOUT,
            )
            .await?;
        if reply.op != OpCode::MetaSync {
            bail!("META_SYNC answered with {:?}", reply.op);
        }
        let response: MetaSync = bincode::deserialize(&reply.payload)?;
        self.registry.merge_snapshot(&response.snapshot);
        tracing::info!("metadata reconciled with {label}");
        Ok(())
    }

    /// Side notification from the placement engine: repeated send failures
    /// age the peer so the next sweep tips it offline sooner.
    pub fn note_unreachable(&self, label: NodeLabel) {
        self.registry.penalize(label, HEARTBEAT_INTERVAL);
    }

    // --- background loops ---

    pub fn start(self: &Arc<Self>) {
        tracing::info!("starting membership service");

        let service = self.clone();
        tokio::spawn(async move {
            service.emit_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.receive_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.sweep_loop().await;
        });
    }

    async fn emit_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            let Some(label) = self.local_label() else {
                continue;
            };

            let heartbeat = crate::transport::messages::Heartbeat {
                label,
                seq: self.heartbeat_seq.fetch_add(1, Ordering::Relaxed),
                capacity: self.store.capacity_bytes(),
                used: self.store.used_bytes(),
            };
            // Keep our own table entry fresh while we are at it.
            self.registry
                .record_local_usage(label, heartbeat.capacity, heartbeat.used);

            for peer in self.registry.nodes() {
                if peer.label == label || peer.liveness == Liveness::Gone {
                    continue;
                }
                if let Err(e) = self.heartbeat.send(&heartbeat, peer.udp_addr).await {
                    tracing::debug!("heartbeat to {} failed: {e:#}", peer.label);
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let (heartbeat, src) = match self.heartbeat.recv().await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("heartbeat receive failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            match self.registry.touch_heartbeat(
                heartbeat.label,
                heartbeat.capacity,
                heartbeat.used,
            ) {
                Some(true) => {
                    tracing::info!("{} is back online", heartbeat.label);
                    let _ = self.returned_tx.send(heartbeat.label);
                    let service = self.clone();
                    let label = heartbeat.label;
                    tokio::spawn(async move {
                        if let Err(e) = service.meta_sync_with(label).await {
                            tracing::warn!("reconciliation with {label} failed: {e:#}");
                        }
                    });
                }
                Some(false) => {}
                None => {
                    tracing::debug!("heartbeat from unknown sender {} at {src}", heartbeat.label);
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let expired = self
                .registry
                .sweep_offline(self.local_label(), HEARTBEAT_EXPIRY);
            for label in expired {
                tracing::warn!("{label} went offline (no heartbeat for {HEARTBEAT_EXPIRY:?})");
                if let Some(entry) = self.registry.node(label) {
                    self.pool.evict(entry.tcp_addr);
                }
            }
        }
    }
}
