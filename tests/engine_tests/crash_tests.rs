//! Crash-point tests
//!
//! Each test arms one `CrashPoint`, drives a checkpoint into it, and then
//! reopens the data directory without the crash point. These tests verify:
//! - The simulated crash surfaces as `SimulatedCrash` and fails the engine
//! - Recovery finds a tiled leaf chain
//! - Every acknowledged write survives with its newest value

#[path = "../common/mod.rs"]
mod common;

use bytes::Bytes;
use tempfile::TempDir;
use tierkv::config::{Config, CrashPoint, LogSyncStrategy};
use tierkv::key::Key;
use tierkv::{Engine, TierError};

// =============================================================================
// Helper Functions
// =============================================================================

fn config(temp_dir: &TempDir, workers: usize, crash: Option<CrashPoint>) -> Config {
    let builder = common::test_builder(temp_dir.path())
        .workers_per_node(workers)
        .log_sync_strategy(LogSyncStrategy::EveryWrite);
    match crash {
        Some(point) => builder.crash_point(point).build(),
        None => builder.build(),
    }
}

/// Preload `preload` even keys and close, then write keys `0..keys` (each
/// twice), crash a checkpoint at `point` and reopen.
fn crash_and_recover(point: CrashPoint, workers: usize, keys: u64, preload: u64) {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();

    if preload > 0 {
        let engine = Engine::open(config(&temp_dir, workers, None)).unwrap();
        for n in 0..preload {
            engine.insert(&common::key(n * 2), b"preload").unwrap();
        }
        engine.close().unwrap();
    }

    {
        let engine = Engine::open(config(&temp_dir, workers, Some(point))).unwrap();
        for n in 0..keys {
            engine.insert(&common::key(n), b"stale").unwrap();
        }
        for n in 0..keys {
            engine.insert(&common::key(n), &common::value(n)).unwrap();
        }

        let err = engine.force_checkpoint().unwrap_err();
        assert!(
            matches!(err, TierError::SimulatedCrash(p) if p == point),
            "expected crash at {:?}, got {:?}",
            point,
            err
        );
        assert!(engine.is_failed());
        assert!(matches!(engine.insert(b"after", b"crash"), Err(TierError::EngineFailed)));
    }

    let engine = Engine::open(config(&temp_dir, workers, None)).unwrap();
    let chain = engine.leaf_ranges();
    assert_eq!(chain.first().unwrap().lfence, Key::MIN);
    assert_eq!(chain.last().unwrap().rfence, Key::MAX);
    for pair in chain.windows(2) {
        assert_eq!(pair[0].rfence, pair[1].lfence);
    }

    for n in 0..keys.max(preload * 2) {
        let expected = if n < keys {
            Some(Bytes::from(common::value(n)))
        } else if n % 2 == 0 {
            Some(Bytes::from("preload"))
        } else {
            None
        };
        assert_eq!(
            engine.lookup(&common::key(n)).unwrap(),
            expected,
            "key {} after crash at {:?}",
            n,
            point
        );
    }
    assert_eq!(engine.lookup(b"after").unwrap(), None);

    // the recovered engine checkpoints normally
    engine.insert(b"later", b"ok").unwrap();
    engine.force_checkpoint().unwrap();
    assert_eq!(engine.lookup(b"later").unwrap(), Some(Bytes::from("ok")));
}

// =============================================================================
// Leaf Batch Crash Points
// =============================================================================

#[test]
fn test_crash_after_no_smo_barrier() {
    crash_and_recover(CrashPoint::AfterNoSmoBarrier, 1, 10, 10);
}

#[test]
fn test_crash_after_inplace_entries() {
    crash_and_recover(CrashPoint::AfterInplaceEntries, 1, 10, 0);
}

#[test]
fn test_crash_after_prebuild_barrier() {
    crash_and_recover(CrashPoint::AfterPrebuildBarrier, 1, 60, 0);
}

#[test]
fn test_crash_after_prebuild_publish() {
    crash_and_recover(CrashPoint::AfterPrebuildPublish, 1, 60, 0);
}

// =============================================================================
// Balancing Crash Points
// =============================================================================

// two workers on one node split an 80-op leaf between them

#[test]
fn test_crash_after_split_barrier() {
    crash_and_recover(CrashPoint::AfterSplitBarrier, 2, 80, 0);
}

#[test]
fn test_crash_after_split_publish() {
    crash_and_recover(CrashPoint::AfterSplitPublish, 2, 80, 0);
}

// =============================================================================
// Cursor Commit Crash Point
// =============================================================================

#[test]
fn test_crash_before_cursor_commit() {
    crash_and_recover(CrashPoint::BeforeCursorCommit, 1, 30, 10);
}

/// An older write on one lane and a newer one on another: a crash while the
/// consumed cursors are being published must not let the older one win.
#[test]
fn test_cursor_commit_crash_keeps_newest_across_lanes() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();

    {
        let engine = Engine::open(config(&temp_dir, 1, Some(CrashPoint::BeforeCursorCommit))).unwrap();
        let first = engine.thread_join().unwrap();
        let second = engine.thread_join().unwrap();
        assert_ne!(first.lane(), second.lane());

        for n in 0..8 {
            second.insert(&common::key(n), b"old").unwrap();
        }
        for n in 0..8 {
            first.insert(&common::key(n), b"new").unwrap();
        }
        second.insert(&common::key(100), b"only-second").unwrap();

        let err = engine.force_checkpoint().unwrap_err();
        assert!(matches!(err, TierError::SimulatedCrash(CrashPoint::BeforeCursorCommit)));
        // the leaves already hold the newest values
        assert_eq!(engine.pending_records(), 17);
    }

    let engine = Engine::open(config(&temp_dir, 1, None)).unwrap();
    assert_eq!(engine.pending_records(), 0);
    for n in 0..8 {
        assert_eq!(engine.lookup(&common::key(n)).unwrap(), Some(Bytes::from("new")), "key {}", n);
    }
    assert_eq!(
        engine.lookup(&common::key(100)).unwrap(),
        Some(Bytes::from("only-second"))
    );
    engine.close().unwrap();

    let engine = Engine::open(config(&temp_dir, 1, None)).unwrap();
    assert_eq!(engine.lookup(&common::key(3)).unwrap(), Some(Bytes::from("new")));
}

// Preloaded leaves [MIN, k40) and [k40, MAX) take 40 and 120 ops: the first
// fits in place, the second splits between the workers into an in-place
// half and a prebuilt half, so every crash point is reached.
#[test]
fn test_every_crash_point_recovers_under_load() {
    for point in CrashPoint::ALL {
        crash_and_recover(point, 2, 160, 40);
    }
}
