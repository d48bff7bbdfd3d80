//! # tierkv
//!
//! A persistent key-value engine for machines with a fast volatile tier
//! (DRAM) in front of a byte-addressable durable tier, with:
//! - Per-thread durable logs for low-latency writes
//! - A DRAM bridging index that buffers recent writes per key range
//! - Durable B+-tree-style leaves striped across NUMA-colored modules
//! - A parallel, NUMA-balanced checkpoint pipeline
//! - Crash recovery by replaying unconsumed log records
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ThreadHandle (one per thread)                │
//! │          insert / remove / lookup / scan / checkpoint        │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │ append                       │ read
//!                ▼                              ▼
//!   ┌────────────────────────┐     ┌─────────────────────────────┐
//!   │    Log lanes (durable) │◀────│ Bridging index (DRAM)       │
//!   │ staging ─▶ ring        │     │ coarse index ─▶ inode chain │
//!   └───────────┬────────────┘     └──────────────┬──────────────┘
//!               │ fetch                           │ miss
//!               ▼                                 ▼
//!   ┌────────────────────────┐     ┌─────────────────────────────┐
//!   │  Checkpoint pipeline   │────▶│  Leaves (durable, colored)  │
//!   │ cluster ─▶ balance ─▶  │     │  chain [MIN, MAX)           │
//!   │ flush ─▶ sync ─▶ clean │     └─────────────────────────────┘
//!   └────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod key;
pub mod search;
pub mod sync;

pub mod region;
pub mod leaf;
pub mod log;
pub mod index;
pub mod shim;
pub mod checkpoint;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use checkpoint::CheckpointStats;
pub use config::{Config, CrashPoint, Durability, LogSyncStrategy};
pub use engine::{Engine, ThreadHandle};
pub use error::{Result, TierError};
pub use index::{BTreeIndex, CoarseIndex, ShimRef};
pub use key::{Key, Value, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use leaf::{LeafId, LeafRange};
pub use shim::{ShimRange, UpsertStatus};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tierkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
