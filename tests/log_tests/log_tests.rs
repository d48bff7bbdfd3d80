//! Tests for the per-lane durable log
//!
//! These tests verify:
//! - Appends are stamped in order and readable from staging or the ring
//! - Write-back happens at the watermark, on every write, or when forced
//! - Fetch returns one generation at a time and stops at the other
//! - Advancing the start cursor consumes records durably
//! - Several lanes' cursors advance together or not at all
//! - A full ring refuses further appends

#[path = "../common/mod.rs"]
mod common;

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tierkv::config::{Config, CrashPoint, LogSyncStrategy};
use tierkv::key::{Key, Value};
use tierkv::log::{LogLayer, OpKind};
use tierkv::region::Descriptor;
use tierkv::TierError;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_log(config: &Config) -> (Arc<Descriptor>, LogLayer) {
    common::init_tracing();
    let descriptor = Arc::new(Descriptor::open(&config.data_dir, config.max_threads, config.durability).unwrap());
    let log = LogLayer::open(&config.data_dir, config, Arc::clone(&descriptor)).unwrap();
    (descriptor, log)
}

fn setup_log(dir: &Path) -> (Arc<Descriptor>, LogLayer) {
    open_log(&common::test_config(dir))
}

fn put(log: &LogLayer, lane: usize, n: u64) {
    log.append(
        lane,
        OpKind::Insert,
        Key::new(&common::key(n)).unwrap(),
        Value::new(&common::value(n)).unwrap(),
    )
    .unwrap();
}

// =============================================================================
// Append & Read Tests
// =============================================================================

#[test]
fn test_append_stamps_and_positions() {
    let temp_dir = TempDir::new().unwrap();
    let (_, log) = setup_log(temp_dir.path());

    let key = Key::new(b"a").unwrap();
    let first = log.append(0, OpKind::Insert, key, Value::new(b"1").unwrap()).unwrap();
    let second = log.append(0, OpKind::Remove, key, Value::EMPTY).unwrap();
    let other = log.append(1, OpKind::Insert, key, Value::new(b"2").unwrap()).unwrap();

    assert!(first.stamp < second.stamp && second.stamp < other.stamp);
    assert_eq!((first.id.lane(), first.id.pos()), (0, 0));
    assert_eq!((second.id.lane(), second.id.pos()), (0, 1));
    assert_eq!((other.id.lane(), other.id.pos()), (1, 0));
    assert!(!first.flip);
    assert_eq!(log.pending(), 3);

    let read = log.read(second.id).unwrap();
    assert_eq!(read.kind, OpKind::Remove);
    assert_eq!(read.stamp, second.stamp);
}

#[test]
fn test_read_across_write_back() {
    let temp_dir = TempDir::new().unwrap();
    let (_, log) = setup_log(temp_dir.path());

    let ids: Vec<_> = (0..20)
        .map(|n| {
            log.append(
                0,
                OpKind::Insert,
                Key::from_u64(n),
                Value::new(&n.to_le_bytes()).unwrap(),
            )
            .unwrap()
            .id
        })
        .collect();

    // some records now live in the ring, the rest in staging
    for (n, id) in ids.into_iter().enumerate() {
        let record = log.read(id).unwrap();
        assert_eq!(record.key, Key::from_u64(n as u64));
    }
}

// =============================================================================
// Write-back Tests
// =============================================================================

#[test]
fn test_watermark_write_back() {
    let temp_dir = TempDir::new().unwrap();
    let (descriptor, log) = setup_log(temp_dir.path());

    for n in 0..7 {
        put(&log, 0, n);
    }
    assert_eq!(descriptor.cursor(0), (0, 0), "below watermark stays staged");

    put(&log, 0, 7);
    assert_eq!(descriptor.cursor(0), (0, 8));
}

#[test]
fn test_every_write_strategy() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::test_builder(temp_dir.path())
        .log_sync_strategy(LogSyncStrategy::EveryWrite)
        .build();
    let (descriptor, log) = open_log(&config);

    for n in 0..3 {
        put(&log, 2, n);
        assert_eq!(descriptor.cursor(2), (0, n + 1));
    }
}

#[test]
fn test_force_write_back() {
    let temp_dir = TempDir::new().unwrap();
    let (descriptor, log) = setup_log(temp_dir.path());

    for n in 0..3 {
        put(&log, 1, n);
    }
    assert_eq!(log.fetch(1, false).unwrap().records.len(), 0, "staged records are not durable yet");

    log.force_write_back(1).unwrap();
    assert_eq!(descriptor.cursor(1), (0, 3));
    assert_eq!(log.fetch(1, false).unwrap().records.len(), 3);

    // nothing staged: a no-op
    log.force_write_back(1).unwrap();
    assert_eq!(descriptor.cursor(1), (0, 3));
}

// =============================================================================
// Fetch & Consume Tests
// =============================================================================

#[test]
fn test_fetch_by_generation() {
    let temp_dir = TempDir::new().unwrap();
    let (_, log) = setup_log(temp_dir.path());

    for n in 0..3 {
        put(&log, 0, n);
    }
    assert!(!log.toggle_flip());
    assert!(log.flip());
    for n in 3..5 {
        put(&log, 0, n);
    }
    log.force_write_back(0).unwrap();

    let old = log.fetch(0, false).unwrap();
    assert_eq!(old.records.len(), 3);
    assert_eq!(old.new_start, 3);
    assert!(old.records.iter().all(|r| !r.flip));
    assert!(old.records.windows(2).all(|w| w[0].stamp < w[1].stamp));

    // the newer generation sits behind the older one
    assert!(log.fetch(0, true).unwrap().records.is_empty());

    log.advance(&[(0, old.new_start)]).unwrap();
    assert_eq!(log.pending(), 2);
    let new = log.fetch(0, true).unwrap();
    assert_eq!(new.records.len(), 2);
    assert_eq!(new.new_start, 5);
}

#[test]
fn test_advance_is_monotonic() {
    let temp_dir = TempDir::new().unwrap();
    let (descriptor, log) = setup_log(temp_dir.path());
    for n in 0..8 {
        put(&log, 0, n);
    }
    log.advance(&[(0, 5)]).unwrap();
    log.advance(&[(0, 2)]).unwrap();
    assert_eq!(descriptor.cursor(0), (5, 8));
    assert_eq!(log.pending(), 3);
}

#[test]
fn test_unconsumed_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (_, log) = setup_log(temp_dir.path());
        for n in 0..10 {
            put(&log, 3, n);
        }
        log.force_write_back(3).unwrap();
        log.advance(&[(3, 4)]).unwrap();
    }

    let (_, log) = setup_log(temp_dir.path());
    assert_eq!(log.pending(), 6);
    let fetched = log.fetch_all(3).unwrap();
    assert_eq!(fetched.records.len(), 6);
    assert_eq!(fetched.records[0].key, Key::new(&common::key(4)).unwrap());
    assert_eq!(fetched.new_start, 10);
}

#[test]
fn test_lanes_advance_together() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::test_builder(temp_dir.path())
        .crash_point(CrashPoint::BeforeCursorCommit)
        .build();
    {
        let (descriptor, log) = open_log(&config);
        for n in 0..6 {
            put(&log, 0, n);
            put(&log, 1, n);
        }
        log.force_write_back(0).unwrap();
        log.force_write_back(1).unwrap();

        let err = log.advance(&[(0, 4), (1, 6)]).unwrap_err();
        assert!(matches!(err, TierError::SimulatedCrash(CrashPoint::BeforeCursorCommit)));
        assert_eq!(descriptor.cursor(0), (0, 6));
        assert_eq!(descriptor.cursor(1), (0, 6));
        assert_eq!(log.pending(), 12);
    }

    let (descriptor, log) = setup_log(temp_dir.path());
    assert_eq!(log.pending(), 12, "no lane consumed after the crash");
    log.advance(&[(0, 4), (1, 6)]).unwrap();
    assert_eq!(descriptor.cursor(0), (4, 6));
    assert_eq!(descriptor.cursor(1), (6, 6));
    assert_eq!(log.pending(), 2);
}

#[test]
fn test_full_ring_refuses_append() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::test_builder(temp_dir.path()).log_capacity(64).build();
    let (_, log) = open_log(&config);

    for n in 0..64 {
        assert!(log.has_room(0));
        put(&log, 0, n);
    }
    assert!(!log.has_room(0));
    let err = log
        .append(0, OpKind::Insert, Key::from_u64(99), Value::EMPTY)
        .unwrap_err();
    assert!(matches!(err, TierError::CapacityExhausted { .. }));

    log.force_write_back(0).unwrap();
    log.advance(&[(0, 32)]).unwrap();
    assert!(log.has_room(0));
}
