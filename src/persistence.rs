//! On-disk configuration and node identity.
//!
//! Three small JSON documents live in the data directory: `config.json`
//! (ports, capacity, storage dir), `node_state.json` (label and group
//! fingerprint, the identity a restarting node reclaims with) and
//! `metadata.json` (the registry snapshot, handled in `metadata::snapshot`).
//! Defaults are written back on first start so an operator always has a file
//! to edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::metadata::types::NodeLabel;

pub const MIN_CAPACITY_BYTES: u64 = 50 * 1024 * 1024;
pub const MAX_CAPACITY_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_TCP_PORT: u16 = 8888;
pub const DEFAULT_UDP_PORT: u16 = 8889;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capacity_bytes: u64,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub storage_dir: PathBuf,
    /// Fixed slice size for file blocks. Must be identical across the group.
    pub block_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity_bytes: MIN_CAPACITY_BYTES,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            storage_dir: default_storage_dir(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Config {
    /// Clamp persisted values back into their legal windows. A hand-edited
    /// config never takes the node outside the capacity bounds.
    pub fn sanitized(mut self) -> Self {
        self.capacity_bytes = self
            .capacity_bytes
            .clamp(MIN_CAPACITY_BYTES, MAX_CAPACITY_BYTES);
        if self.block_size == 0 {
            self.block_size = DEFAULT_BLOCK_SIZE;
        }
        self
    }
}

/// Platform user directory holding the shared block files.
pub fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("espacioCompartido")
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

fn node_state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("node_state.json")
}

pub fn metadata_path(data_dir: &Path) -> PathBuf {
    data_dir.join("metadata.json")
}

pub fn load_config(data_dir: &Path) -> Result<Config> {
    let path = config_path(data_dir);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        return Ok(config.sanitized());
    }

    let config = Config::default();
    save_config(data_dir, &config)?;
    Ok(config)
}

pub fn save_config(data_dir: &Path, config: &Config) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let raw = serde_json::to_string_pretty(config)?;
    std::fs::write(config_path(data_dir), raw)?;
    Ok(())
}

/// Persistent identity: the label this node holds in its group and the
/// fingerprint minted when the group was formed. Presented on reconnect to
/// reclaim the same slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeState {
    pub label: NodeLabel,
    pub group_fingerprint: String,
}

pub fn load_node_state(data_dir: &Path) -> Option<NodeState> {
    let raw = std::fs::read_to_string(node_state_path(data_dir)).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn save_node_state(data_dir: &Path, state: &NodeState) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let raw = serde_json::to_string_pretty(state)?;
    std::fs::write(node_state_path(data_dir), raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.capacity_bytes, MIN_CAPACITY_BYTES);
        assert_eq!(config.tcp_port, DEFAULT_TCP_PORT);
        assert!(dir.path().join("config.json").exists());

        // Second load reads the written file.
        let again = load_config(dir.path()).unwrap();
        assert_eq!(again.udp_port, config.udp_port);
    }

    #[test]
    fn out_of_window_capacity_is_clamped() {
        let config = Config {
            capacity_bytes: 500 * 1024 * 1024,
            ..Config::default()
        }
        .sanitized();
        assert_eq!(config.capacity_bytes, MAX_CAPACITY_BYTES);

        let config = Config {
            capacity_bytes: 1,
            ..Config::default()
        }
        .sanitized();
        assert_eq!(config.capacity_bytes, MIN_CAPACITY_BYTES);
    }

    #[test]
    fn node_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_node_state(dir.path()).is_none());

        let state = NodeState {
            label: NodeLabel(2),
            group_fingerprint: "fp-123".to_string(),
        };
        save_node_state(dir.path(), &state).unwrap();
        assert_eq!(load_node_state(dir.path()), Some(state));
    }
}
