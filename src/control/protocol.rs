//! Control Surface Protocol
//!
//! Endpoint paths and Data Transfer Objects for the HTTP facade an external
//! UI talks to. These mirror the operations in `surface.rs`; the facade adds
//! nothing beyond serialization.

use serde::{Deserialize, Serialize};

use super::surface::{BlockRow, FileRow, NodeRow, StatusRow};

// --- API Endpoints ---

/// Node status summary (label, peers, totals).
pub const ENDPOINT_STATUS: &str = "/status";
/// Current node registry view.
pub const ENDPOINT_NODES: &str = "/nodes";
/// Files in the shared namespace.
pub const ENDPOINT_FILES: &str = "/files";
/// Block placements as seen from this node.
pub const ENDPOINT_BLOCKS: &str = "/blocks";
/// Join a group through a peer address.
pub const ENDPOINT_CONNECT: &str = "/connect";
/// Upload a local file into the mesh.
pub const ENDPOINT_UPLOAD: &str = "/upload";
/// Reassemble a file to a local path.
pub const ENDPOINT_DOWNLOAD: &str = "/download";
/// Delete a file everywhere.
pub const ENDPOINT_DELETE: &str = "/delete";
/// Change this node's declared capacity (only while alone).
pub const ENDPOINT_CAPACITY: &str = "/capacity";

// --- Data Transfer Objects ---

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    /// `host:port` of any group member's reliable channel.
    pub peer_addr: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub assigned_label: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    /// Path of the file on this node's filesystem (the UI runs beside it).
    pub local_path: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub name: String,
    pub local_path: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CapacityRequest {
    pub bytes: u64,
}

/// Uniform outcome envelope: `error` carries the stable code from
/// [`crate::error::OpError::code`] when `ok` is false.
#[derive(Debug, Serialize)]
pub struct OpResponse {
    pub ok: bool,
    pub error: Option<String>,
    pub detail: Option<String>,
}

impl OpResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
        }
    }

    pub fn err(code: &str, detail: String) -> Self {
        Self {
            ok: false,
            error: Some(code.to_string()),
            detail: Some(detail),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeRow>,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileRow>,
}

#[derive(Debug, Serialize)]
pub struct BlocksResponse {
    pub blocks: Vec<BlockRow>,
}

pub type StatusResponse = StatusRow;
