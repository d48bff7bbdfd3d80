//! Tests for durable regions and the descriptor
//!
//! These tests verify:
//! - Regions are created zero-filled and keep their contents across reopen
//! - A region file of the wrong size is rejected
//! - The layout header is checksummed and compared on reopen
//! - Init flag, head leaf and per-lane cursors persist
//! - Start cursors only change when the commit word is bumped

use std::fs;
use std::sync::atomic::Ordering;

use tempfile::TempDir;
use tierkv::config::{Config, Durability};
use tierkv::region::{Descriptor, DurableRegion, LayoutHeader};
use tierkv::TierError;

// =============================================================================
// Durable Region Tests
// =============================================================================

#[test]
fn test_region_created_zeroed() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.tkv");

    let (region, created) = DurableRegion::open(&path, 64, Durability::Msync).unwrap();
    assert!(created);
    assert_eq!(region.len_words(), 64);
    assert!(region.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
    assert_eq!(fs::metadata(&path).unwrap().len(), 64 * 8);
}

#[test]
fn test_region_contents_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.tkv");

    {
        let (region, _) = DurableRegion::open(&path, 32, Durability::Msync).unwrap();
        region.bulk_copy(4, &[11, 22, 33]);
        region.persist(4, 3).unwrap();
    }

    let (region, created) = DurableRegion::open(&path, 32, Durability::Msync).unwrap();
    assert!(!created);
    let mut out = [0u64; 3];
    region.read_into(4, &mut out);
    assert_eq!(out, [11, 22, 33]);
}

#[test]
fn test_region_size_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.tkv");
    drop(DurableRegion::open(&path, 32, Durability::Fence).unwrap());

    let result = DurableRegion::open(&path, 48, Durability::Fence);
    assert!(matches!(result, Err(TierError::LayoutMismatch(_))));
}

// =============================================================================
// Descriptor Tests
// =============================================================================

fn header() -> LayoutHeader {
    LayoutHeader::from_config(&Config::builder().max_threads(4).build())
}

#[test]
fn test_descriptor_layout_check() {
    let temp_dir = TempDir::new().unwrap();
    let descriptor = Descriptor::open(temp_dir.path(), 4, Durability::Fence).unwrap();
    assert!(!descriptor.is_initialized());

    descriptor.write_layout(&header()).unwrap();
    assert_eq!(descriptor.read_layout().unwrap(), header());
    descriptor.check_layout(&header()).unwrap();

    let mut other = header();
    other.log_capacity *= 2;
    assert!(matches!(
        descriptor.check_layout(&other),
        Err(TierError::LayoutMismatch(_))
    ));
}

#[test]
fn test_descriptor_unwritten_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let descriptor = Descriptor::open(temp_dir.path(), 4, Durability::Fence).unwrap();
    assert!(matches!(descriptor.read_layout(), Err(TierError::Corruption(_))));
}

#[test]
fn test_descriptor_state_persists() {
    let temp_dir = TempDir::new().unwrap();
    {
        let descriptor = Descriptor::open(temp_dir.path(), 4, Durability::Msync).unwrap();
        descriptor.write_layout(&header()).unwrap();
        descriptor.set_head(17).unwrap();
        descriptor.set_end(2, 90).unwrap();
        descriptor.stage_starts(&[(2, 40)]).unwrap();
        descriptor.commit_starts().unwrap();
        descriptor.set_initialized().unwrap();
    }

    let descriptor = Descriptor::open(temp_dir.path(), 4, Durability::Msync).unwrap();
    assert!(descriptor.is_initialized());
    assert_eq!(descriptor.lanes(), 4);
    assert_eq!(descriptor.head(), 17);
    assert_eq!(descriptor.cursor(2), (40, 90));
    assert_eq!(descriptor.cursor(0), (0, 0));
}

#[test]
fn test_staged_starts_invisible_until_commit() {
    let temp_dir = TempDir::new().unwrap();
    {
        let descriptor = Descriptor::open(temp_dir.path(), 4, Durability::Msync).unwrap();
        for lane in 0..4 {
            descriptor.set_end(lane, 50).unwrap();
        }
        descriptor.stage_starts(&[(0, 10), (1, 20)]).unwrap();
        assert_eq!(descriptor.commit_starts().unwrap(), 1);

        // crash between staging and commit
        descriptor.stage_starts(&[(1, 30), (3, 45)]).unwrap();
        assert_eq!(descriptor.cursor(1), (20, 50));
        assert_eq!(descriptor.cursor(3), (0, 50));
    }

    let descriptor = Descriptor::open(temp_dir.path(), 4, Durability::Msync).unwrap();
    assert_eq!(descriptor.commit_seq(), 1);
    let starts: Vec<u64> = (0..4).map(|lane| descriptor.cursor(lane).0).collect();
    assert_eq!(starts, vec![10, 20, 0, 0]);

    // restaging starts from the committed bank, not the abandoned one
    descriptor.stage_starts(&[(2, 5)]).unwrap();
    assert_eq!(descriptor.commit_starts().unwrap(), 2);
    let starts: Vec<u64> = (0..4).map(|lane| descriptor.cursor(lane).0).collect();
    assert_eq!(starts, vec![10, 20, 5, 0]);
}
