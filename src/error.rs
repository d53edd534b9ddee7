//! Typed outcomes for control-surface operations.
//!
//! Transport plumbing and background tasks use `anyhow::Result`; the
//! operations an external UI calls return these variants so callers can
//! distinguish "the mesh is too small" from "the disk broke".

use crate::metadata::types::NodeLabel;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpError {
    /// Aggregate free bytes or peer count cannot satisfy 2x the file size.
    #[error("insufficient capacity: need {needed} bytes over >= 2 online nodes, have {available}")]
    InsufficientCapacity { needed: u64, available: u64 },

    /// Both hosts of the block at this index are offline.
    #[error("block {index} has no online host")]
    Unavailable { index: u32 },

    /// File or block id unknown.
    #[error("not found: {0}")]
    Missing(String),

    /// A file with this name already exists (or existed; deletes are terminal).
    #[error("file name already taken: {0}")]
    DuplicateName(String),

    /// Capacity changes are only permitted while disconnected.
    #[error("capacity cannot change while the node is in a group")]
    InGroup,

    /// Requested capacity is below the bytes already stored here.
    #[error("capacity below current used bytes")]
    BelowUsed,

    /// Requested capacity is outside the 50-100 MiB window.
    #[error("capacity outside the permitted range")]
    OutOfRange,

    /// Transient: the peer did not answer. Retried by the placement engine.
    #[error("peer {0} unreachable")]
    PeerUnreachable(NodeLabel),

    /// Malformed frame or unexpected opcode; the connection is closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local disk read/write failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// The caller cancelled; partial side effects were rolled back.
    #[error("operation cancelled")]
    Cancelled,
}

impl OpError {
    /// Stable machine-readable code for the control surface facade.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::Unavailable { .. } => "unavailable",
            Self::Missing(_) => "missing",
            Self::DuplicateName(_) => "duplicate_name",
            Self::InGroup => "in_group",
            Self::BelowUsed => "below_used",
            Self::OutOfRange => "out_of_range",
            Self::PeerUnreachable(_) => "peer_unreachable",
            Self::Protocol(_) => "protocol_error",
            Self::Storage(_) => "storage_error",
            Self::Cancelled => "cancelled",
        }
    }
}
