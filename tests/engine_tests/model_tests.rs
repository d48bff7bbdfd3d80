//! Property-based tests for Engine
//!
//! Random operation sequences run against the engine and a `BTreeMap` oracle.
//! Checkpoints and crash-style reopens (drop without close) are part of the
//! sequence, so every answer must survive both.

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;
use tempfile::TempDir;
use tierkv::config::{Config, LogSyncStrategy};
use tierkv::Engine;

/// Keys are drawn from a small space so operations collide often
const KEY_SPACE: u64 = 96;

// ============================================================================
//  Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u16),
    Remove(u64),
    Lookup(u64),
    Scan(u64, u64, usize),
    Checkpoint,
    Reopen,
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            8 => (0..KEY_SPACE, any::<u16>()).prop_map(|(k, v)| Op::Insert(k, v)),
            3 => (0..KEY_SPACE).prop_map(Op::Remove),
            3 => (0..KEY_SPACE).prop_map(Op::Lookup),
            1 => (0..KEY_SPACE, 0..KEY_SPACE, 1..40usize).prop_map(|(a, b, n)| Op::Scan(a, b, n)),
            1 => Just(Op::Checkpoint),
            1 => Just(Op::Reopen),
        ],
        1..=max_ops,
    )
}

fn model_config(temp_dir: &TempDir) -> Config {
    common::test_builder(temp_dir.path())
        .log_sync_strategy(LogSyncStrategy::EveryWrite)
        .log_capacity(256)
        .leaf_capacity(512)
        .inode_capacity(1024)
        .build()
}

fn val(v: u16) -> Vec<u8> {
    format!("v{}", v).into_bytes()
}

// ============================================================================
//  Model Check
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every lookup and scan agrees with the oracle
    #[test]
    fn engine_matches_btreemap(ops in operations(300)) {
        common::init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let mut engine = Engine::open(model_config(&temp_dir)).unwrap();
        let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    engine.insert(&common::key(k), &val(v)).unwrap();
                    model.insert(k, val(v));
                }
                Op::Remove(k) => {
                    engine.remove(&common::key(k)).unwrap();
                    model.remove(&k);
                }
                Op::Lookup(k) => {
                    let got = engine.lookup(&common::key(k)).unwrap();
                    prop_assert_eq!(got, model.get(&k).map(|v| Bytes::from(v.clone())), "lookup {}", k);
                }
                Op::Scan(a, b, limit) => {
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    let got = engine.scan_range(&common::key(lo), &common::key(hi), limit).unwrap();
                    let expected: Vec<(Bytes, Bytes)> = model
                        .range(lo..hi)
                        .take(limit)
                        .map(|(k, v)| (Bytes::from(common::key(*k)), Bytes::from(v.clone())))
                        .collect();
                    prop_assert_eq!(got, expected, "scan [{}, {}) limit {}", lo, hi, limit);
                }
                Op::Checkpoint => {
                    engine.force_checkpoint().unwrap();
                }
                Op::Reopen => {
                    drop(engine);
                    engine = Engine::open(model_config(&temp_dir)).unwrap();
                }
            }
        }

        let all = engine.scan(b"", usize::MAX).unwrap();
        let expected: Vec<(Bytes, Bytes)> = model
            .iter()
            .map(|(k, v)| (Bytes::from(common::key(*k)), Bytes::from(v.clone())))
            .collect();
        prop_assert_eq!(all, expected);
    }
}
