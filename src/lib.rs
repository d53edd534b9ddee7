//! Peer-to-Peer Distributed Block Store Library
//!
//! This library crate defines the core modules of the mesh. It is the
//! foundation for the node binary (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of five loosely coupled subsystems:
//!
//! - **`membership`**: The group coordination layer. Handles the
//!   `HELLO`/`WELCOME` join handshake, `nodo<K>` label assignment and
//!   reclaim, UDP heartbeats and the failure detector.
//! - **`metadata`**: The replicated state layer. Every node holds the full
//!   node/file/block tables; mutations are versioned, broadcast, and merged
//!   with last-writer-wins rules, persisted via write-behind snapshots.
//! - **`storage`**: The local disk layer. Fixed-size block files in a shared
//!   directory with a byte-accurate usage counter.
//! - **`placement`**: The replication engine. Splits files into 1 MiB
//!   blocks, places an original and a replica on distinct nodes, drives
//!   downloads, deletes and rollback.
//! - **`transport`**: The wire layer. Framed TCP request/response with
//!   correlation ids plus lossy UDP heartbeat datagrams.
//!
//! `control` exposes the operations an external UI calls, and `node` wires
//! everything together.

pub mod control;
pub mod error;
pub mod membership;
pub mod metadata;
pub mod node;
pub mod persistence;
pub mod placement;
pub mod storage;
pub mod transport;
