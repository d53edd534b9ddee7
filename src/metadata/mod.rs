//! Replicated Metadata Module
//!
//! Owns the canonical tables of the group: nodes, files and blocks. Every
//! node holds a full replica; mutations are versioned, broadcast over the
//! reliable channel and merged with last-writer-wins rules, so the mesh
//! converges without a coordinator.
//!
//! ## Core Mechanisms
//! - **Single mutex**: all tables sit behind one lock; mutations are short
//!   and never perform I/O while holding it.
//! - **Versioned deltas**: each mutation stamps a monotonic version used by
//!   `META_SYNC` reconciliation and the snapshot writer.
//! - **Terminal deletes**: removed files leave tombstones, so a delete can
//!   never be undone by a stale announcement.
//! - **Write-behind snapshots**: a background task persists the tables to
//!   `metadata.json` via temp-file + atomic rename.

pub mod registry;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod tests;
