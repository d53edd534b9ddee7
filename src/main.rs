use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use axum::routing::{get, post};
use axum::{Extension, Router};

use blockmesh::control::handlers::*;
use blockmesh::control::protocol::{
    ENDPOINT_BLOCKS, ENDPOINT_CAPACITY, ENDPOINT_CONNECT, ENDPOINT_DELETE, ENDPOINT_DOWNLOAD,
    ENDPOINT_FILES, ENDPOINT_NODES, ENDPOINT_STATUS, ENDPOINT_UPLOAD,
};
use blockmesh::control::surface::ControlSurface;
use blockmesh::node::Node;
use blockmesh::persistence;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut data_dir: Option<PathBuf> = None;
    let mut bind_ip: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let mut http_port: u16 = 9888;
    let mut seed: Option<SocketAddr> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" => {
                data_dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--bind-ip" => {
                bind_ip = args[i + 1].parse()?;
                i += 2;
            }
            "--http-port" => {
                http_port = args[i + 1].parse()?;
                i += 2;
            }
            "--connect" => {
                seed = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!(
                    "Usage: {} [--data-dir <dir>] [--bind-ip <ip>] [--http-port <port>] [--connect <addr:port>]",
                    args[0]
                );
                eprintln!("Ports and capacity come from <data-dir>/config.json (written on first start).");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other} (try --help)");
                std::process::exit(1);
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".blockmesh")
    });
    let config = persistence::load_config(&data_dir)?;

    tracing::info!("starting node (data dir {})", data_dir.display());
    let node = Node::bootstrap(data_dir, config, bind_ip).await?;
    let surface = ControlSurface::new(node.clone());

    // Join through a seed right away when one was given; otherwise the node
    // waits alone until the UI calls /connect or someone connects to it.
    if let Some(seed) = seed {
        match node.membership.connect(seed).await {
            Ok(label) => tracing::info!("joined via {seed} as {label}"),
            Err(e) => tracing::error!("joining via {seed} failed: {e:#}"),
        }
    }

    let app = Router::new()
        .route(ENDPOINT_STATUS, get(handle_status))
        .route(ENDPOINT_NODES, get(handle_nodes))
        .route(ENDPOINT_FILES, get(handle_files))
        .route(ENDPOINT_BLOCKS, get(handle_blocks))
        .route(ENDPOINT_CONNECT, post(handle_connect))
        .route(ENDPOINT_UPLOAD, post(handle_upload))
        .route(ENDPOINT_DOWNLOAD, post(handle_download))
        .route(ENDPOINT_DELETE, post(handle_delete))
        .route(ENDPOINT_CAPACITY, post(handle_capacity))
        .layer(Extension(surface));

    let http_addr = SocketAddr::new(bind_ip, http_port);
    tracing::info!("control surface listening on {http_addr}");
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
