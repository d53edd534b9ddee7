//! Membership & Failure Detection Module
//!
//! Manages the peer set of the group: who is in it, under which label, and
//! whether they are currently reachable.
//!
//! ## Core Mechanisms
//! - **Join handshake**: `HELLO`/`WELCOME` over the reliable channel assigns
//!   group-unique `nodo<K>` labels and hands the joiner the peer list plus a
//!   metadata snapshot. Peers rebroadcast `PEER_LIST` on first contact, so
//!   the mesh closes within two round trips.
//! - **Label reclaim**: a reconnecting node presents its persisted label and
//!   group fingerprint; a matching offline slot is handed back instead of a
//!   fresh one.
//! - **Heartbeats**: UDP datagrams every 3 seconds; 9 silent seconds mark a
//!   peer offline. Offline is soft: there is only one replica per block, so
//!   failure never triggers data movement.
//! - **Reconciliation**: the offline-to-online edge triggers a `META_SYNC`
//!   exchange merged under the registry's convergence rules.

pub mod service;
