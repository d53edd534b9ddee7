//! Node assembly: wires the registry, store, membership and placement
//! engine together, binds both channels and dispatches inbound frames.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::membership::service::MembershipService;
use crate::metadata::registry::MetadataRegistry;
use crate::metadata::types::{Liveness, NodeLabel};
use crate::metadata::{snapshot, types::now_ms};
use crate::persistence::{self, Config};
use crate::placement::engine::PlacementEngine;
use crate::storage::blocks::BlockStore;
use crate::transport::frame::{Frame, OpCode, FRAME_SLACK};
use crate::transport::messages::{
    decode_block_put, encode_ack, encode_block_get_reply, AckStatus, BlockDelete, BlockGet,
    CapacityUpdate, FileAnnounce, FileDelete, Hello, MetaSync, PeerList,
};
use crate::transport::tcp::{self, PeerPool};
use crate::transport::udp::HeartbeatSocket;

pub struct Node {
    pub registry: Arc<MetadataRegistry>,
    pub store: Arc<BlockStore>,
    pub membership: Arc<MembershipService>,
    pub engine: Arc<PlacementEngine>,
    pub data_dir: PathBuf,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    config: Mutex<Config>,
}

impl Node {
    /// Boots a node: loads persisted state (a corrupt snapshot refuses to
    /// start), binds both channels, spawns the background services.
    ///
    /// Port 0 in the config binds an ephemeral port; the advertised
    /// addresses always carry the resolved ones.
    pub async fn bootstrap(data_dir: PathBuf, config: Config, bind_ip: IpAddr) -> Result<Arc<Self>> {
        let snapshot_path = persistence::metadata_path(&data_dir);
        let initial = snapshot::load(&snapshot_path)?.unwrap_or_default();
        let registry = Arc::new(MetadataRegistry::new(initial));

        let store = Arc::new(BlockStore::open(
            config.storage_dir.clone(),
            config.capacity_bytes,
        )?);
        let max_payload = config.block_size + FRAME_SLACK;
        let pool = PeerPool::new(max_payload);

        let listener = TcpListener::bind(SocketAddr::new(bind_ip, config.tcp_port))
            .await
            .context("binding reliable channel")?;
        let tcp_addr = listener.local_addr()?;

        let heartbeat = HeartbeatSocket::bind(SocketAddr::new(bind_ip, config.udp_port))
            .await
            .context("binding heartbeat channel")?;
        let udp_addr = heartbeat.local_addr()?;

        let membership = MembershipService::new(
            registry.clone(),
            store.clone(),
            pool.clone(),
            heartbeat,
            tcp_addr,
            udp_addr,
            data_dir.clone(),
        );
        let engine = PlacementEngine::new(
            registry.clone(),
            store.clone(),
            pool,
            membership.clone(),
            config.block_size,
        );

        let node = Arc::new(Self {
            registry: registry.clone(),
            store,
            membership,
            engine,
            data_dir,
            tcp_addr,
            udp_addr,
            config: Mutex::new(config),
        });

        node.normalize_after_boot();
        node.engine.collect_tombstoned().await;

        snapshot::spawn_writer(registry, snapshot_path);
        node.membership.start();
        node.engine.start();

        let dispatch_node = node.clone();
        tokio::spawn(async move {
            let handler = move |peer, frame| {
                let node = dispatch_node.clone();
                async move { node.dispatch(peer, frame).await }
            };
            if let Err(e) = tcp::serve(listener, max_payload, handler).await {
                tracing::error!("reliable channel server stopped: {e:#}");
            }
        });

        tracing::info!(
            "node up: tcp {tcp_addr}, udp {udp_addr}, label {:?}",
            node.membership.local_label()
        );
        Ok(node)
    }

    /// A restarted node trusts its snapshot for identity but not for
    /// liveness: peers are offline until their heartbeats say otherwise,
    /// and this node's own entry is refreshed from the local store.
    fn normalize_after_boot(&self) {
        let local = self.membership.local_label();
        for entry in self.registry.nodes() {
            if Some(entry.label) == local {
                continue;
            }
            if entry.liveness == Liveness::Online {
                self.registry.mark_node(entry.label, Liveness::Offline);
            }
        }
        if let Some(label) = local {
            self.registry.upsert_node(crate::metadata::types::NodeEntry {
                label,
                tcp_addr: self.tcp_addr,
                udp_addr: self.udp_addr,
                capacity: self.store.capacity_bytes(),
                used: self.store.used_bytes(),
                liveness: Liveness::Online,
                updated_at: now_ms(),
                last_seen: Some(std::time::Instant::now()),
            });
        }
    }

    pub fn config(&self) -> Config {
        self.config.lock().expect("config mutex poisoned").clone()
    }

    pub fn update_capacity(&self, capacity_bytes: u64) -> Result<()> {
        let mut config = self.config.lock().expect("config mutex poisoned");
        config.capacity_bytes = capacity_bytes;
        persistence::save_config(&self.data_dir, &config)
    }

    pub fn local_label(&self) -> Option<NodeLabel> {
        self.membership.local_label()
    }

    /// Routes one inbound request frame. `None` closes the connection: the
    /// peer sent something that is not a request.
    async fn dispatch(self: Arc<Self>, peer: SocketAddr, frame: Frame) -> Option<Frame> {
        let correlation = frame.correlation;
        let ack = |status: AckStatus| Frame::new(OpCode::Ack, correlation, encode_ack(status));

        match frame.op {
            OpCode::Hello => {
                let hello: Hello = decode(&frame.payload, peer)?;
                match self.membership.handle_hello(&hello) {
                    Ok(welcome) => {
                        let payload = bincode::serialize(&welcome).ok()?;
                        Some(Frame::new(OpCode::Welcome, correlation, payload))
                    }
                    Err(e) => {
                        tracing::warn!("HELLO from {peer} refused: {e:#}");
                        Some(ack(AckStatus::Refused))
                    }
                }
            }
            OpCode::PeerList => {
                let msg: PeerList = decode(&frame.payload, peer)?;
                let membership = self.membership.clone();
                // Meshing with newcomers dials out; keep this connection's
                // read loop responsive meanwhile.
                tokio::spawn(async move {
                    membership.handle_peer_list(msg).await;
                });
                Some(ack(AckStatus::Ok))
            }
            OpCode::MetaSync => {
                let msg: MetaSync = decode(&frame.payload, peer)?;
                let reply = self.membership.handle_meta_sync(&msg);
                let payload = bincode::serialize(&reply).ok()?;
                Some(Frame::new(OpCode::MetaSync, correlation, payload))
            }
            OpCode::BlockPut => {
                let msg = match decode_block_put(&frame.payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("malformed BLOCK_PUT from {peer}: {e}");
                        return None;
                    }
                };
                Some(ack(self.engine.handle_block_put(msg).await))
            }
            OpCode::BlockGet => {
                let msg: BlockGet = decode(&frame.payload, peer)?;
                let reply = self.engine.handle_block_get(&msg.id).await;
                Some(Frame::new(
                    OpCode::BlockGetReply,
                    correlation,
                    encode_block_get_reply(&reply),
                ))
            }
            OpCode::BlockDelete => {
                let msg: BlockDelete = decode(&frame.payload, peer)?;
                Some(ack(self.engine.handle_block_delete(&msg.id).await))
            }
            OpCode::FileAnnounce => {
                let msg: FileAnnounce = decode(&frame.payload, peer)?;
                self.engine.handle_file_announce(msg);
                Some(ack(AckStatus::Ok))
            }
            OpCode::FileDelete => {
                let msg: FileDelete = decode(&frame.payload, peer)?;
                self.engine.handle_file_delete(msg).await;
                Some(ack(AckStatus::Ok))
            }
            OpCode::CapacityUpdate => {
                let msg: CapacityUpdate = decode(&frame.payload, peer)?;
                self.engine.handle_capacity_update(&msg);
                Some(ack(AckStatus::Ok))
            }
            // Response opcodes are never valid requests.
            OpCode::Welcome | OpCode::BlockGetReply | OpCode::Ack => {
                tracing::warn!("{peer} sent response opcode {:?} as a request", frame.op);
                None
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8], peer: SocketAddr) -> Option<T> {
    match bincode::deserialize(payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!("malformed payload from {peer}: {e}");
            None
        }
    }
}
