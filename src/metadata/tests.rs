//! Registry Tests
//!
//! Exercises the mutators, the last-writer-wins merge rules and the
//! tombstone semantics that the convergence law depends on.

use std::time::Duration;

use crate::error::OpError;
use crate::metadata::registry::MetadataRegistry;
use crate::metadata::types::{
    now_ms, BlockEntry, BlockId, FileEntry, Liveness, MetadataSnapshot, NodeEntry, NodeLabel,
};

fn node(k: u32, capacity: u64, used: u64) -> NodeEntry {
    NodeEntry {
        label: NodeLabel(k),
        tcp_addr: format!("127.0.0.1:{}", 8000 + k).parse().unwrap(),
        udp_addr: format!("127.0.0.1:{}", 9000 + k).parse().unwrap(),
        capacity,
        used,
        liveness: Liveness::Online,
        updated_at: now_ms(),
        last_seen: Some(std::time::Instant::now()),
    }
}

fn file_with_blocks(name: &str, sizes: &[u64], original: u32, replica: u32) -> (FileEntry, Vec<BlockEntry>) {
    let blocks: Vec<BlockEntry> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| BlockEntry {
            id: BlockId::new(name, i as u32),
            size,
            original: NodeLabel(original),
            replica: NodeLabel(replica),
        })
        .collect();
    let file = FileEntry {
        name: name.to_string(),
        size: sizes.iter().sum(),
        owner: NodeLabel(original),
        created_at: now_ms(),
        blocks: blocks.iter().map(|b| b.id.clone()).collect(),
    };
    (file, blocks)
}

fn empty_registry() -> MetadataRegistry {
    MetadataRegistry::new(MetadataSnapshot::default())
}

// ============================================================
// VERSIONING
// ============================================================

#[test]
fn every_mutation_bumps_the_version() {
    let registry = empty_registry();
    let v0 = registry.version();

    let v1 = registry.upsert_node(node(1, 100, 0));
    assert!(v1 > v0);

    let (file, blocks) = file_with_blocks("a.bin", &[10], 1, 2);
    registry.upsert_node(node(2, 100, 0));
    let v2 = registry.add_file(file, blocks).unwrap();
    assert!(v2 > v1);

    registry.remove_file("a.bin").unwrap();
    assert!(registry.version() > v2);
}

// ============================================================
// LABEL ASSIGNMENT
// ============================================================

#[test]
fn next_label_is_one_past_the_maximum() {
    let registry = empty_registry();
    assert_eq!(registry.next_label(), NodeLabel(1));

    registry.upsert_node(node(1, 100, 0));
    registry.upsert_node(node(3, 100, 0));
    // Holes are not reused: nodo3 exists, so the next slot is nodo4.
    assert_eq!(registry.next_label(), NodeLabel(4));
}

// ============================================================
// FILE / BLOCK LIFECYCLE
// ============================================================

#[test]
fn add_file_rejects_duplicate_and_tombstoned_names() {
    let registry = empty_registry();
    registry.upsert_node(node(1, 100, 0));
    registry.upsert_node(node(2, 100, 0));

    let (file, blocks) = file_with_blocks("doc.bin", &[5, 5], 1, 2);
    registry.add_file(file.clone(), blocks.clone()).unwrap();

    let (dup, dup_blocks) = file_with_blocks("doc.bin", &[5], 2, 1);
    assert!(matches!(
        registry.add_file(dup, dup_blocks),
        Err(OpError::DuplicateName(_))
    ));

    registry.remove_file("doc.bin").unwrap();
    assert!(registry.is_tombstoned("doc.bin"));

    // Deletes are terminal: the name cannot come back.
    let (again, again_blocks) = file_with_blocks("doc.bin", &[5], 1, 2);
    assert!(matches!(
        registry.add_file(again, again_blocks),
        Err(OpError::DuplicateName(_))
    ));
}

#[test]
fn add_file_rejects_colocated_placements() {
    let registry = empty_registry();
    registry.upsert_node(node(1, 100, 0));

    let (file, mut blocks) = file_with_blocks("x.bin", &[5], 1, 2);
    blocks[0].replica = NodeLabel(1);
    assert!(registry.add_file(file, blocks).is_err());
}

#[test]
fn remove_file_returns_blocks_and_is_idempotent() {
    let registry = empty_registry();
    registry.upsert_node(node(1, 100, 0));
    registry.upsert_node(node(2, 100, 0));
    let (file, blocks) = file_with_blocks("doc.bin", &[7, 3], 1, 2);
    registry.add_file(file, blocks).unwrap();

    let (_, removed) = registry.remove_file("doc.bin").unwrap();
    assert_eq!(removed.len(), 2);
    assert!(registry.blocks_of("doc.bin").is_empty());

    // Second delete reports missing.
    assert!(registry.remove_file("doc.bin").is_none());
}

#[test]
fn set_block_hosts_validates_hosts() {
    let registry = empty_registry();
    registry.upsert_node(node(1, 100, 0));
    registry.upsert_node(node(2, 100, 0));
    registry.upsert_node(node(3, 100, 0));
    let (file, blocks) = file_with_blocks("doc.bin", &[7], 1, 2);
    let id = blocks[0].id.clone();
    registry.add_file(file, blocks).unwrap();

    registry.set_block_hosts(&id, NodeLabel(3), NodeLabel(1)).unwrap();
    let entry = registry.block(&id).unwrap();
    assert_eq!(entry.original, NodeLabel(3));

    assert!(registry.set_block_hosts(&id, NodeLabel(3), NodeLabel(3)).is_err());
    assert!(registry.set_block_hosts(&id, NodeLabel(9), NodeLabel(1)).is_err());
}

// ============================================================
// MERGE / CONVERGENCE
// ============================================================

#[test]
fn merge_prefers_fresher_node_entries() {
    let registry = empty_registry();
    let mut stale = node(1, 100, 40);
    stale.updated_at = 1_000;
    registry.upsert_node(stale);

    let mut fresh = node(1, 100, 10);
    fresh.updated_at = 2_000;
    let changed = registry.merge_snapshot(&MetadataSnapshot {
        version: 0,
        nodes: vec![fresh],
        ..Default::default()
    });
    assert!(changed);
    assert_eq!(registry.node(NodeLabel(1)).unwrap().used, 10);

    // An older report never rolls the entry back.
    let mut older = node(1, 100, 99);
    older.updated_at = 500;
    registry.merge_snapshot(&MetadataSnapshot {
        version: 0,
        nodes: vec![older],
        ..Default::default()
    });
    assert_eq!(registry.node(NodeLabel(1)).unwrap().used, 10);
}

#[test]
fn merge_tombstone_wins_over_announce() {
    let registry = empty_registry();
    registry.upsert_node(node(1, 100, 0));
    registry.upsert_node(node(2, 100, 0));
    let (file, blocks) = file_with_blocks("doc.bin", &[4], 1, 2);

    // The delete arrives first (race across the mesh) ...
    registry.merge_snapshot(&MetadataSnapshot {
        version: 5,
        tombstones: vec!["doc.bin".to_string()],
        ..Default::default()
    });

    // ... then a stale announce. It must not resurrect the file.
    registry.merge_snapshot(&MetadataSnapshot {
        version: 3,
        files: vec![file],
        blocks,
        ..Default::default()
    });
    assert!(registry.file("doc.bin").is_none());
    assert!(registry.is_tombstoned("doc.bin"));
}

#[test]
fn merge_is_idempotent_and_symmetric() {
    let a = empty_registry();
    let b = empty_registry();

    a.upsert_node(node(1, 100, 5));
    b.upsert_node(node(2, 80, 3));
    let (file, blocks) = file_with_blocks("doc.bin", &[4], 1, 2);
    b.upsert_node(node(1, 100, 5));
    b.add_file(file, blocks).unwrap();
    let (old, old_blocks) = file_with_blocks("old.bin", &[2], 2, 1);
    b.add_file(old, old_blocks).unwrap();
    b.remove_file("old.bin").unwrap();

    // One sync round in each direction.
    a.merge_snapshot(&b.snapshot());
    b.merge_snapshot(&a.snapshot());
    a.merge_snapshot(&b.snapshot());

    let sa = a.snapshot();
    let sb = b.snapshot();
    assert_eq!(sa.nodes.len(), sb.nodes.len());
    assert_eq!(sa.files.len(), sb.files.len());
    assert_eq!(sa.blocks.len(), sb.blocks.len());
    assert_eq!(sa.tombstones, sb.tombstones);

    // Merging the same snapshot again changes nothing.
    assert!(!a.merge_snapshot(&sb));
}

// ============================================================
// LIVENESS / FAILURE DETECTOR SUPPORT
// ============================================================

#[test]
fn heartbeat_reports_the_offline_to_online_edge() {
    let registry = empty_registry();
    registry.upsert_node(node(2, 100, 0));

    assert_eq!(registry.touch_heartbeat(NodeLabel(2), 100, 7), Some(false));
    registry.mark_node(NodeLabel(2), Liveness::Offline);
    // The returning heartbeat reports the edge and refreshes usage.
    assert_eq!(registry.touch_heartbeat(NodeLabel(2), 100, 9), Some(true));
    assert_eq!(registry.node(NodeLabel(2)).unwrap().used, 9);

    // Unknown senders are ignored.
    assert_eq!(registry.touch_heartbeat(NodeLabel(9), 100, 0), None);
}

#[test]
fn sweep_marks_silent_peers_offline() {
    let registry = empty_registry();
    let mut peer = node(2, 100, 0);
    peer.last_seen = Some(
        std::time::Instant::now()
            .checked_sub(Duration::from_secs(30))
            .unwrap(),
    );
    registry.upsert_node(peer);
    registry.upsert_node(node(1, 100, 0));

    let expired = registry.sweep_offline(Some(NodeLabel(1)), Duration::from_secs(9));
    assert_eq!(expired, vec![NodeLabel(2)]);
    assert!(!registry.is_online(NodeLabel(2)));
    // The local node is never swept.
    assert!(registry.is_online(NodeLabel(1)));
}

#[test]
fn retrievable_tracks_host_liveness() {
    let registry = empty_registry();
    registry.upsert_node(node(1, 100, 0));
    registry.upsert_node(node(2, 100, 0));
    let (file, blocks) = file_with_blocks("doc.bin", &[4, 4], 1, 2);
    registry.add_file(file, blocks).unwrap();

    assert!(registry.is_retrievable("doc.bin"));

    registry.mark_node(NodeLabel(2), Liveness::Offline);
    // One host per block still online.
    assert!(registry.is_retrievable("doc.bin"));

    registry.mark_node(NodeLabel(1), Liveness::Offline);
    assert!(!registry.is_retrievable("doc.bin"));
}
