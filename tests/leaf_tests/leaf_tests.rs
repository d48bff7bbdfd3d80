//! Tests for the persistent leaf layer
//!
//! These tests verify:
//! - The sentinel leaf covers the whole key space
//! - Batches update, remove and insert in place when they fit
//! - Overflowing batches prebuild half-full replacement leaves
//! - Split and recolor keep the chain tiled and move entries across colors
//! - Recovery walks the chain and rebuilds the free lists
//! - Crashes at each leaf barrier leave either the old or the new chain

#[path = "../common/mod.rs"]
mod common;

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tierkv::config::{Config, CrashPoint};
use tierkv::key::{Key, Value};
use tierkv::leaf::{BatchOp, LeafRange, LeafStore, LEAF_FANOUT};
use tierkv::log::OpKind;
use tierkv::region::Descriptor;
use tierkv::TierError;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_store(config: &Config) -> LeafStore {
    let descriptor = Arc::new(Descriptor::open(&config.data_dir, config.max_threads, config.durability).unwrap());
    LeafStore::open(&config.data_dir, config, descriptor).unwrap()
}

fn fresh_store(dir: &Path) -> (Config, LeafStore) {
    common::init_tracing();
    let config = common::test_config(dir);
    let store = open_store(&config);
    store.create_sentinel().unwrap();
    (config, store)
}

fn k(n: u64) -> Key {
    Key::new(&common::key(n)).unwrap()
}

fn insert(n: u64) -> BatchOp {
    BatchOp {
        key: k(n),
        value: Value::new(&common::value(n)).unwrap(),
        kind: OpKind::Insert,
    }
}

fn remove(n: u64) -> BatchOp {
    BatchOp {
        key: k(n),
        value: Value::EMPTY,
        kind: OpKind::Remove,
    }
}

fn assert_tiled(chain: &[LeafRange]) {
    assert_eq!(chain.first().unwrap().lfence, Key::MIN);
    assert_eq!(chain.last().unwrap().rfence, Key::MAX);
    for pair in chain.windows(2) {
        assert_eq!(pair[0].rfence, pair[1].lfence, "gap or overlap in leaf chain");
    }
}

fn all_entries(store: &LeafStore) -> Vec<u64> {
    store
        .ranges()
        .iter()
        .flat_map(|r| store.snapshot(r.leaf))
        .map(|e| {
            let text = String::from_utf8(e.key.as_bytes().to_vec()).unwrap();
            text.trim_start_matches("key-").parse().unwrap()
        })
        .collect()
}

// =============================================================================
// Batch Tests
// =============================================================================

#[test]
fn test_sentinel_covers_key_space() {
    let temp_dir = TempDir::new().unwrap();
    let (_, store) = fresh_store(temp_dir.path());

    let chain = store.ranges();
    assert_eq!(chain.len(), 1);
    assert_tiled(&chain);
    assert_eq!(store.count(chain[0].leaf), 0);
}

#[test]
fn test_batch_in_place() {
    let temp_dir = TempDir::new().unwrap();
    let (_, store) = fresh_store(temp_dir.path());
    let leaf = store.head().unwrap();

    let ops: Vec<BatchOp> = (0..10).map(insert).collect();
    let boundaries = store.run_batch(leaf, &ops).unwrap();
    assert_eq!(boundaries.leaves, vec![(Key::MIN, leaf)]);
    assert_eq!(boundaries.rfence, Key::MAX);
    assert_eq!(store.count(leaf), 10);
    assert_eq!(store.lookup(leaf, &k(3)).unwrap().as_bytes(), b"value-3");

    // update one, remove one, remove an absent key
    let update = BatchOp {
        key: k(4),
        value: Value::new(b"fresh").unwrap(),
        kind: OpKind::Insert,
    };
    store.run_batch(leaf, &[remove(2), update, remove(50)]).unwrap();
    assert_eq!(store.count(leaf), 9);
    assert!(store.lookup(leaf, &k(2)).is_none());
    assert_eq!(store.lookup(leaf, &k(4)).unwrap().as_bytes(), b"fresh");
    assert_eq!(all_entries(&store), vec![0, 1, 3, 4, 5, 6, 7, 8, 9]);
}

#[test]
fn test_batch_overflow_prebuilds() {
    let temp_dir = TempDir::new().unwrap();
    let (_, store) = fresh_store(temp_dir.path());
    let sentinel = store.head().unwrap();
    let free_before = store.free_count(0);

    let n = LEAF_FANOUT as u64 + 10;
    let ops: Vec<BatchOp> = (0..n).map(insert).collect();
    let boundaries = store.run_batch(sentinel, &ops).unwrap();

    assert_eq!(boundaries.leaves.len(), 2);
    assert_eq!(boundaries.leaves[0].0, Key::MIN);
    assert_eq!(boundaries.leaves[1].0, k(LEAF_FANOUT as u64 / 2));
    assert_eq!(boundaries.rfence, Key::MAX);

    let chain = store.ranges();
    assert_eq!(chain.len(), 2);
    assert_tiled(&chain);
    assert!(chain.iter().all(|r| r.leaf != sentinel));
    assert_eq!(all_entries(&store), (0..n).collect::<Vec<_>>());

    // the replaced sentinel waits for a grace period
    assert_eq!(store.free_count(0), free_before - 2);
    assert_eq!(store.recycle(), 1);
    assert_eq!(store.free_count(0), free_before - 1);
}

#[test]
fn test_batch_reuses_removed_slots_in_place() {
    let temp_dir = TempDir::new().unwrap();
    let (_, store) = fresh_store(temp_dir.path());
    let leaf = store.head().unwrap();
    let full = LEAF_FANOUT as u64;
    store.run_batch(leaf, &(0..full).map(insert).collect::<Vec<_>>()).unwrap();
    assert_eq!(store.count(leaf), LEAF_FANOUT);

    // five removals make room for five new keys in the same batch
    let mut ops: Vec<BatchOp> = (0..5).map(remove).collect();
    ops.extend((100..105).map(insert));
    let boundaries = store.run_batch(leaf, &ops).unwrap();

    assert_eq!(boundaries.leaves, vec![(Key::MIN, leaf)]);
    assert_eq!(store.count(leaf), LEAF_FANOUT);
    let expected: Vec<u64> = (5..full).chain(100..105).collect();
    assert_eq!(all_entries(&store), expected);
}

#[test]
fn test_batch_mixed_ops_prebuild_keeps_old_entries() {
    let temp_dir = TempDir::new().unwrap();
    let (_, store) = fresh_store(temp_dir.path());
    let leaf = store.head().unwrap();
    store
        .run_batch(leaf, &(0..30).map(|n| insert(n * 2)).collect::<Vec<_>>())
        .unwrap();

    let ops: Vec<BatchOp> = (0..30).map(|n| insert(n * 2 + 1)).collect();
    let boundaries = store.run_batch(leaf, &ops).unwrap();
    assert!(boundaries.leaves.len() >= 2);
    assert_eq!(all_entries(&store), (0..60).collect::<Vec<_>>());
}

// =============================================================================
// Split & Recolor Tests
// =============================================================================

#[test]
fn test_split_and_recolor_across_nodes() {
    let temp_dir = TempDir::new().unwrap();
    common::init_tracing();
    let config = common::test_builder(temp_dir.path()).numa_nodes(2).build();
    let store = open_store(&config);
    let sentinel = store.create_sentinel().unwrap();
    store.run_batch(sentinel, &(0..20).map(insert).collect::<Vec<_>>()).unwrap();

    let (left, right) = store.split_and_recolor(sentinel, Some(k(8)), 0, 1).unwrap();
    let right = right.unwrap();
    assert_eq!(left.color(), 0);
    assert_eq!(right.color(), 1);
    assert_eq!(store.count(left), 8);
    assert_eq!(store.count(right), 12);

    let chain = store.ranges();
    assert_eq!(chain.len(), 2);
    assert_tiled(&chain);
    assert_eq!(chain[1].lfence, k(8));
    assert_eq!(all_entries(&store), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_recolor_whole_leaf() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::test_builder(temp_dir.path()).numa_nodes(2).build();
    let store = open_store(&config);
    let sentinel = store.create_sentinel().unwrap();
    store.run_batch(sentinel, &(0..5).map(insert).collect::<Vec<_>>()).unwrap();

    let (moved, none) = store.split_and_recolor(sentinel, None, 1, 1).unwrap();
    assert!(none.is_none());
    assert_eq!(moved.color(), 1);
    assert_eq!(store.head(), Some(moved));
    assert_eq!(store.count(moved), 5);
}

#[test]
fn test_split_cut_outside_range() {
    let temp_dir = TempDir::new().unwrap();
    let (_, store) = fresh_store(temp_dir.path());
    let sentinel = store.head().unwrap();

    let result = store.split_and_recolor(sentinel, Some(Key::MIN), 0, 0);
    assert!(matches!(result, Err(TierError::Corruption(_))));
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_recover_chain_after_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let expected = {
        let (_, store) = fresh_store(temp_dir.path());
        let sentinel = store.head().unwrap();
        store.run_batch(sentinel, &(0..100).map(insert).collect::<Vec<_>>()).unwrap();
        store.ranges()
    };

    let config = common::test_config(temp_dir.path());
    let store = open_store(&config);
    let chain = store.recover_chain().unwrap();
    assert_eq!(chain, expected);
    assert_tiled(&chain);
    assert_eq!(store.free_count(0), config.leaf_capacity - chain.len());
    assert_eq!(all_entries(&store), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_recover_chain_empty_store_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::test_config(temp_dir.path());
    let store = open_store(&config);
    // head word is zero, which names leaf 0 with zeroed fences
    assert!(matches!(store.recover_chain(), Err(TierError::Corruption(_))));
}

/// Run an overflowing batch that crashes at `point`, then recover
fn crash_during_prebuild(point: CrashPoint) -> Vec<u64> {
    let temp_dir = TempDir::new().unwrap();
    {
        let (_, store) = fresh_store(temp_dir.path());
        let sentinel = store.head().unwrap();
        store.run_batch(sentinel, &(0..10).map(insert).collect::<Vec<_>>()).unwrap();
    }
    {
        let config = common::test_builder(temp_dir.path()).crash_point(point).build();
        let store = open_store(&config);
        store.recover_chain().unwrap();
        let leaf = store.head().unwrap();
        let err = store
            .run_batch(leaf, &(10..60).map(insert).collect::<Vec<_>>())
            .unwrap_err();
        assert!(matches!(err, TierError::SimulatedCrash(p) if p == point));
    }

    let config = common::test_config(temp_dir.path());
    let store = open_store(&config);
    let chain = store.recover_chain().unwrap();
    assert_tiled(&chain);
    all_entries(&store)
}

#[test]
fn test_crash_before_prebuild_publish_keeps_old_leaf() {
    assert_eq!(
        crash_during_prebuild(CrashPoint::AfterPrebuildBarrier),
        (0..10).collect::<Vec<_>>()
    );
}

#[test]
fn test_crash_after_prebuild_publish_keeps_new_leaves() {
    assert_eq!(
        crash_during_prebuild(CrashPoint::AfterPrebuildPublish),
        (0..60).collect::<Vec<_>>()
    );
}

#[test]
fn test_crash_before_inplace_bitmap_hides_entries() {
    let temp_dir = TempDir::new().unwrap();
    {
        let config = common::test_builder(temp_dir.path())
            .crash_point(CrashPoint::AfterInplaceEntries)
            .build();
        let store = open_store(&config);
        let sentinel = store.create_sentinel().unwrap();
        let err = store
            .run_batch(sentinel, &(0..5).map(insert).collect::<Vec<_>>())
            .unwrap_err();
        assert!(matches!(err, TierError::SimulatedCrash(_)));
    }

    let store = open_store(&common::test_config(temp_dir.path()));
    store.recover_chain().unwrap();
    assert!(all_entries(&store).is_empty());
}
