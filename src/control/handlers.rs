//! Control Surface HTTP Handlers
//!
//! Axum endpoints that expose the [`ControlSurface`] to an external UI.
//! These handlers only translate between HTTP/JSON and the surface calls;
//! all decisions live below them.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;

use super::protocol::*;
use super::surface::ControlSurface;
use crate::error::OpError;
use crate::placement::engine::CancelToken;

fn op_error_response(e: &OpError) -> (StatusCode, Json<OpResponse>) {
    let status = match e {
        OpError::Missing(_) => StatusCode::NOT_FOUND,
        OpError::Storage(_) | OpError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::CONFLICT,
    };
    (status, Json(OpResponse::err(e.code(), e.to_string())))
}

pub async fn handle_status(
    Extension(surface): Extension<Arc<ControlSurface>>,
) -> Json<StatusResponse> {
    Json(surface.status())
}

pub async fn handle_nodes(
    Extension(surface): Extension<Arc<ControlSurface>>,
) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: surface.list_nodes(),
    })
}

pub async fn handle_files(
    Extension(surface): Extension<Arc<ControlSurface>>,
) -> Json<FilesResponse> {
    Json(FilesResponse {
        files: surface.list_files(),
    })
}

pub async fn handle_blocks(
    Extension(surface): Extension<Arc<ControlSurface>>,
) -> Json<BlocksResponse> {
    Json(BlocksResponse {
        blocks: surface.list_blocks(),
    })
}

pub async fn handle_connect(
    Extension(surface): Extension<Arc<ControlSurface>>,
    Json(req): Json<ConnectRequest>,
) -> (StatusCode, Json<ConnectResponse>) {
    let peer = match req.peer_addr.parse() {
        Ok(peer) => peer,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ConnectResponse {
                    assigned_label: None,
                    error: Some(format!("not an address: {}", req.peer_addr)),
                }),
            );
        }
    };

    match surface.connect(peer).await {
        Ok(label) => (
            StatusCode::OK,
            Json(ConnectResponse {
                assigned_label: Some(label.to_string()),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!("connect to {peer} failed: {e:#}");
            (
                StatusCode::BAD_GATEWAY,
                Json(ConnectResponse {
                    assigned_label: None,
                    error: Some(format!("{e:#}")),
                }),
            )
        }
    }
}

pub async fn handle_upload(
    Extension(surface): Extension<Arc<ControlSurface>>,
    Json(req): Json<UploadRequest>,
) -> (StatusCode, Json<OpResponse>) {
    let path = PathBuf::from(req.local_path);
    match surface.upload(&path, &CancelToken::new()).await {
        Ok(()) => (StatusCode::OK, Json(OpResponse::ok())),
        Err(e) => op_error_response(&e),
    }
}

pub async fn handle_download(
    Extension(surface): Extension<Arc<ControlSurface>>,
    Json(req): Json<DownloadRequest>,
) -> (StatusCode, Json<OpResponse>) {
    let path = PathBuf::from(req.local_path);
    match surface.download(&req.name, &path, &CancelToken::new()).await {
        Ok(()) => (StatusCode::OK, Json(OpResponse::ok())),
        Err(e) => op_error_response(&e),
    }
}

pub async fn handle_delete(
    Extension(surface): Extension<Arc<ControlSurface>>,
    Json(req): Json<DeleteRequest>,
) -> (StatusCode, Json<OpResponse>) {
    match surface.delete(&req.name).await {
        Ok(()) => (StatusCode::OK, Json(OpResponse::ok())),
        Err(e) => op_error_response(&e),
    }
}

pub async fn handle_capacity(
    Extension(surface): Extension<Arc<ControlSurface>>,
    Json(req): Json<CapacityRequest>,
) -> (StatusCode, Json<OpResponse>) {
    match surface.set_capacity(req.bytes) {
        Ok(()) => (StatusCode::OK, Json(OpResponse::ok())),
        Err(e) => op_error_response(&e),
    }
}
