//! Block Store Tests

use crate::metadata::types::BlockId;
use crate::storage::blocks::{BlockStore, PutOutcome};

#[tokio::test]
async fn put_get_delete_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path(), 1024).unwrap();

    let id = BlockId::new("doc.bin", 0);
    let data = vec![7u8; 100];

    assert_eq!(store.put(&id, &data).await.unwrap(), PutOutcome::Stored);
    assert_eq!(store.used_bytes(), 100);
    assert_eq!(store.get(&id).await.unwrap().unwrap(), data);

    assert!(store.delete(&id).await.unwrap());
    assert_eq!(store.used_bytes(), 0);
    assert!(store.get(&id).await.unwrap().is_none());

    // Deleting again is a no-op, not an error.
    assert!(!store.delete(&id).await.unwrap());
}

#[tokio::test]
async fn block_files_use_the_shared_naming() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path(), 1024).unwrap();

    store
        .put(&BlockId::new("informe.pdf", 3), b"abc")
        .await
        .unwrap();
    assert!(dir.path().join("informe.pdf__3.blk").exists());
}

#[tokio::test]
async fn full_store_reports_no_space() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path(), 10).unwrap();

    assert_eq!(
        store.put(&BlockId::new("a", 0), &[0u8; 8]).await.unwrap(),
        PutOutcome::Stored
    );
    assert_eq!(
        store.put(&BlockId::new("b", 0), &[0u8; 8]).await.unwrap(),
        PutOutcome::NoSpace
    );
    // The refused block left no file behind.
    assert!(store.get(&BlockId::new("b", 0)).await.unwrap().is_none());
    assert_eq!(store.used_bytes(), 8);
}

#[tokio::test]
async fn overwrite_counts_the_difference() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path(), 100).unwrap();

    let id = BlockId::new("doc.bin", 0);
    store.put(&id, &[1u8; 40]).await.unwrap();
    store.put(&id, &[2u8; 10]).await.unwrap();
    assert_eq!(store.used_bytes(), 10);
}

#[tokio::test]
async fn startup_scan_rebuilds_used_bytes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = BlockStore::open(dir.path(), 1024).unwrap();
        store.put(&BlockId::new("doc.bin", 0), &[0u8; 64]).await.unwrap();
        store.put(&BlockId::new("doc.bin", 1), &[0u8; 32]).await.unwrap();
    }
    // Stray non-block files are not counted.
    std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

    let reopened = BlockStore::open(dir.path(), 1024).unwrap();
    assert_eq!(reopened.used_bytes(), 96);

    let mut listed = reopened.list().unwrap();
    listed.sort();
    assert_eq!(
        listed,
        vec![
            (BlockId::new("doc.bin", 0), 64),
            (BlockId::new("doc.bin", 1), 32),
        ]
    );
}

#[tokio::test]
async fn capacity_change_moves_free_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path(), 100).unwrap();
    store.put(&BlockId::new("a", 0), &[0u8; 30]).await.unwrap();

    assert_eq!(store.free_bytes(), 70);
    store.set_capacity(50);
    assert_eq!(store.free_bytes(), 20);
}
