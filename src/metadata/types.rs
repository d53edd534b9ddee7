use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

/// Group-unique identity of a node, rendered as `nodo<K>`.
///
/// The numeric slot is assigned at join time (one past the current maximum)
/// and preserved across restarts, so a reconnecting node reclaims its label.
/// Ordering is numeric, which is what placement tie-breaks rely on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeLabel(pub u32);

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nodo{}", self.0)
    }
}

impl FromStr for NodeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("nodo")
            .ok_or_else(|| format!("not a node label: {s}"))?;
        let k: u32 = digits
            .parse()
            .map_err(|_| format!("not a node label: {s}"))?;
        if k == 0 {
            return Err(format!("node labels start at nodo1: {s}"));
        }
        Ok(NodeLabel(k))
    }
}

/// Lifecycle state of a peer as observed by the local failure detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Liveness {
    /// Handshake completed or a fresh heartbeat was received.
    Online,
    /// No heartbeat within the expiry window. Soft state: no data moves.
    Offline,
    /// The group was dissolved. Terminal.
    Gone,
}

/// One member of the group.
///
/// `updated_at` is a wall-clock millisecond stamp used by the last-writer-wins
/// merge; `last_seen` is local-only state for the failure detector and never
/// crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub label: NodeLabel,
    /// Reliable-channel address.
    pub tcp_addr: SocketAddr,
    /// Heartbeat address.
    pub udp_addr: SocketAddr,
    /// Declared capacity in bytes.
    pub capacity: u64,
    /// Bytes currently occupied by block placements.
    pub used: u64,
    pub liveness: Liveness,
    pub updated_at: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl NodeEntry {
    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Identity of a block: the slice `index` of the named file's byte stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub file: String,
    pub index: u32,
}

impl BlockId {
    pub fn new(file: impl Into<String>, index: u32) -> Self {
        Self {
            file: file.into(),
            index,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file, self.index)
    }
}

/// A block with its two placements. `original != replica` always.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    pub id: BlockId,
    /// Byte length; at most the group block size, smaller only for the last
    /// block of a file.
    pub size: u64,
    pub original: NodeLabel,
    pub replica: NodeLabel,
}

impl BlockEntry {
    /// A block is available while at least one of its hosts is online.
    pub fn is_available(&self, is_online: impl Fn(NodeLabel) -> bool) -> bool {
        is_online(self.original) || is_online(self.replica)
    }

    pub fn hosts(&self) -> [NodeLabel; 2] {
        [self.original, self.replica]
    }
}

/// A logical file: immutable after upload, destroyed by delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Label of the node that uploaded it.
    pub owner: NodeLabel,
    pub created_at: u64,
    /// Ordered block identifiers forming the byte stream.
    pub blocks: Vec<BlockId>,
}

/// Full registry contents plus the monotonic version counter. This is both
/// the persisted snapshot format and the `META_SYNC` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub version: u64,
    pub nodes: Vec<NodeEntry>,
    pub files: Vec<FileEntry>,
    pub blocks: Vec<BlockEntry>,
    /// Names of deleted files. Deletes are terminal: a tombstoned name never
    /// comes back through a merge.
    pub tombstones: Vec<String>,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod label_tests {
    use super::*;

    #[test]
    fn label_renders_and_parses() {
        let label = NodeLabel(3);
        assert_eq!(label.to_string(), "nodo3");
        assert_eq!("nodo3".parse::<NodeLabel>().unwrap(), label);
    }

    #[test]
    fn label_rejects_garbage() {
        assert!("node3".parse::<NodeLabel>().is_err());
        assert!("nodo".parse::<NodeLabel>().is_err());
        assert!("nodo0".parse::<NodeLabel>().is_err());
        assert!("nodoX".parse::<NodeLabel>().is_err());
    }

    #[test]
    fn label_orders_numerically() {
        let two: NodeLabel = "nodo2".parse().unwrap();
        let ten: NodeLabel = "nodo10".parse().unwrap();
        assert!(two < ten);
    }
}
