//! Wire message bodies for both channels.
//!
//! Control payloads (join handshake, peer lists, metadata sync, heartbeats)
//! are bincode-encoded structs. The two block-carrying payloads are laid out
//! by hand so the byte stream is fixed regardless of codec version:
//!
//! - `BLOCK_PUT`: `file_name_len: u16 | file_name | index: u32 |
//!   is_replica: u8 | block bytes`
//! - `BLOCK_GET_REPLY`: `status: u8 | block bytes?`

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use super::frame::FrameError;
use crate::metadata::types::{BlockEntry, BlockId, FileEntry, MetadataSnapshot, NodeEntry, NodeLabel};

/// Status byte carried by `ACK` and `BLOCK_GET_REPLY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    NoSpace = 1,
    Missing = 2,
    Refused = 3,
}

impl AckStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            1 => Self::NoSpace,
            2 => Self::Missing,
            3 => Self::Refused,
            _ => return None,
        })
    }
}

/// First message of the join handshake, sent to any known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Label persisted from an earlier membership, presented for reclaim.
    pub claimed_label: Option<NodeLabel>,
    /// Fingerprint of the group the claimed label belonged to.
    pub fingerprint: Option<String>,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub capacity: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub assigned_label: NodeLabel,
    pub group_fingerprint: String,
    pub peers: Vec<NodeEntry>,
    pub snapshot: MetadataSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerList {
    /// Dedup id: rebroadcasts of the same discovery are processed once.
    pub op_id: Uuid,
    pub peers: Vec<NodeEntry>,
}

/// Reconciliation request and reply both carry a full versioned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaSync {
    pub snapshot: MetadataSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnnounce {
    pub op_id: Uuid,
    pub file: FileEntry,
    pub blocks: Vec<BlockEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDelete {
    pub op_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityUpdate {
    pub label: NodeLabel,
    pub capacity: u64,
    pub used: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockGet {
    pub id: BlockId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDelete {
    pub id: BlockId,
}

/// Heartbeat datagram for the unreliable channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub label: NodeLabel,
    pub seq: u64,
    pub capacity: u64,
    pub used: u64,
}

// --- hand-laid payloads ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPut {
    pub id: BlockId,
    pub is_replica: bool,
    pub data: Vec<u8>,
}

pub fn encode_block_put(msg: &BlockPut) -> Vec<u8> {
    let name = msg.id.file.as_bytes();
    let mut out = Vec::with_capacity(2 + name.len() + 5 + msg.data.len());
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&msg.id.index.to_be_bytes());
    out.push(msg.is_replica as u8);
    out.extend_from_slice(&msg.data);
    out
}

pub fn decode_block_put(payload: &[u8]) -> Result<BlockPut, FrameError> {
    if payload.len() < 2 {
        return Err(FrameError::BadPayload("BLOCK_PUT shorter than name length".into()));
    }
    let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let fixed = 2 + name_len + 4 + 1;
    if payload.len() < fixed {
        return Err(FrameError::BadPayload("BLOCK_PUT truncated".into()));
    }
    let name = std::str::from_utf8(&payload[2..2 + name_len])
        .map_err(|_| FrameError::BadPayload("BLOCK_PUT file name is not UTF-8".into()))?;
    let index = u32::from_be_bytes(payload[2 + name_len..2 + name_len + 4].try_into().unwrap());
    let is_replica = match payload[2 + name_len + 4] {
        0 => false,
        1 => true,
        other => {
            return Err(FrameError::BadPayload(format!(
                "BLOCK_PUT replica flag {other}"
            )))
        }
    };
    Ok(BlockPut {
        id: BlockId::new(name, index),
        is_replica,
        data: payload[fixed..].to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGetReply {
    pub status: AckStatus,
    pub data: Vec<u8>,
}

pub fn encode_block_get_reply(msg: &BlockGetReply) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + msg.data.len());
    out.push(msg.status as u8);
    out.extend_from_slice(&msg.data);
    out
}

pub fn decode_block_get_reply(payload: &[u8]) -> Result<BlockGetReply, FrameError> {
    let (&status, data) = payload
        .split_first()
        .ok_or_else(|| FrameError::BadPayload("empty BLOCK_GET_REPLY".into()))?;
    let status = AckStatus::from_u8(status)
        .ok_or_else(|| FrameError::BadPayload(format!("BLOCK_GET_REPLY status {status}")))?;
    Ok(BlockGetReply {
        status,
        data: data.to_vec(),
    })
}

pub fn encode_ack(status: AckStatus) -> Vec<u8> {
    vec![status as u8]
}

pub fn decode_ack(payload: &[u8]) -> Result<AckStatus, FrameError> {
    match payload {
        [raw] => AckStatus::from_u8(*raw)
            .ok_or_else(|| FrameError::BadPayload(format!("ACK status {raw}"))),
        _ => Err(FrameError::BadPayload("ACK must be one status byte".into())),
    }
}
