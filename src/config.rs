//! Configuration for tierkv
//!
//! Centralized configuration with sensible defaults. Fields that shape the
//! durable layout (lane count, ring capacity, leaf capacity, NUMA geometry)
//! are recorded in the descriptor and must match on reopen.

use std::path::PathBuf;

use crate::error::{Result, TierError};

/// Hard limit on QSBR slots shared by user lanes and checkpoint workers
pub const MAX_QSBR_SLOTS: usize = 64;

/// Largest NUMA node count a leaf color can encode
pub const MAX_NUMA_NODES: usize = 8;

/// Main configuration for a tierkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all durable regions
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── descriptor.tkv          (layout header, cursors, init flag)
    ///     ├── log-n{node}.tkv         (per-lane circular logs)
    ///     └── leaves-n{c}-m{m}.tkv    (leaf modules, striped per color)
    pub data_dir: PathBuf,

    /// How persist barriers reach the media
    pub durability: Durability,

    // -------------------------------------------------------------------------
    // NUMA Geometry
    // -------------------------------------------------------------------------
    /// Number of NUMA nodes (leaf colors)
    pub numa_nodes: usize,

    /// Durable modules per node that each leaf is striped across
    pub modules_per_node: usize,

    /// Checkpoint workers per node
    pub workers_per_node: usize,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Maximum concurrently joined threads (one log lane each)
    pub max_threads: usize,

    /// Records per lane ring
    pub log_capacity: usize,

    /// Staged records that trigger a write-back (hard cap is twice this)
    pub staging_watermark: usize,

    /// When staged records are written back to the lane ring
    pub log_sync_strategy: LogSyncStrategy,

    // -------------------------------------------------------------------------
    // Checkpoint Configuration
    // -------------------------------------------------------------------------
    /// Pending records (all lanes) that wake the background checkpointer
    pub checkpoint_threshold: usize,

    /// Run a background coordinator thread
    pub background_checkpoint: bool,

    // -------------------------------------------------------------------------
    // Arena Sizes
    // -------------------------------------------------------------------------
    /// Leaf slots per color
    pub leaf_capacity: usize,

    /// DRAM bridging nodes
    pub inode_capacity: usize,

    // -------------------------------------------------------------------------
    // Testing
    // -------------------------------------------------------------------------
    /// Abort a checkpoint right after the named barrier
    pub crash_point: Option<CrashPoint>,
}

/// Log write-back strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSyncStrategy {
    /// Write back and persist after every append (no loss window)
    EveryWrite,

    /// Write back once `staging_watermark` records are staged
    Watermark,
}

/// How a persist barrier is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// `msync` the written range, then fence
    Msync,

    /// Fence only; the page cache is the durable medium
    Fence,
}

/// Barrier points in a checkpoint where a crash can be simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// No-SMO updates and bitmap persisted
    AfterNoSmoBarrier,
    /// In-place inserts' entries persisted, bitmap not yet published
    AfterInplaceEntries,
    /// Prebuilt leaves persisted, not yet linked
    AfterPrebuildBarrier,
    /// Prebuilt leaves linked, old leaf not yet freed
    AfterPrebuildPublish,
    /// Split/recolored leaves persisted, not yet linked
    AfterSplitBarrier,
    /// Split/recolored leaves linked, old leaf not yet freed
    AfterSplitPublish,
    /// Every leaf written and consumed cursors staged, commit word not yet bumped
    BeforeCursorCommit,
}

impl CrashPoint {
    /// Every crash point, in pipeline order
    pub const ALL: [CrashPoint; 7] = [
        CrashPoint::AfterNoSmoBarrier,
        CrashPoint::AfterInplaceEntries,
        CrashPoint::AfterPrebuildBarrier,
        CrashPoint::AfterPrebuildPublish,
        CrashPoint::AfterSplitBarrier,
        CrashPoint::AfterSplitPublish,
        CrashPoint::BeforeCursorCommit,
    ];
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tierkv_data"),
            durability: Durability::Msync,
            numa_nodes: 1,
            modules_per_node: 2,
            workers_per_node: 2,
            max_threads: 16,
            log_capacity: 1 << 15,
            staging_watermark: 32,
            log_sync_strategy: LogSyncStrategy::Watermark,
            checkpoint_threshold: 1 << 14,
            background_checkpoint: true,
            leaf_capacity: 1 << 14,
            inode_capacity: 1 << 16,
            crash_point: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Total checkpoint workers
    pub fn worker_count(&self) -> usize {
        self.numa_nodes * self.workers_per_node
    }

    /// Hard cap on staged records per lane
    pub fn staging_cap(&self) -> usize {
        self.staging_watermark * 2
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: String) -> Result<()> {
            Err(TierError::Config(msg))
        }

        if self.numa_nodes == 0 || self.numa_nodes > MAX_NUMA_NODES {
            return bad(format!("numa_nodes must be in 1..={}", MAX_NUMA_NODES));
        }
        if self.modules_per_node == 0 || self.modules_per_node > 11 {
            return bad("modules_per_node must be in 1..=11".to_string());
        }
        if self.workers_per_node == 0 {
            return bad("workers_per_node must be at least 1".to_string());
        }
        if self.max_threads == 0 || self.max_threads > 255 {
            return bad("max_threads must be in 1..=255".to_string());
        }
        let slots = self.max_threads + self.worker_count();
        if slots > MAX_QSBR_SLOTS {
            return bad(format!(
                "max_threads + workers = {} exceeds {} thread slots",
                slots, MAX_QSBR_SLOTS
            ));
        }
        if self.staging_watermark == 0 {
            return bad("staging_watermark must be at least 1".to_string());
        }
        if self.log_capacity < 4 * self.staging_cap() {
            return bad(format!(
                "log_capacity {} must be at least four staging caps ({})",
                self.log_capacity,
                4 * self.staging_cap()
            ));
        }
        if self.checkpoint_threshold == 0 {
            return bad("checkpoint_threshold must be at least 1".to_string());
        }
        if self.leaf_capacity < 2 || self.leaf_capacity >= (1 << 29) - 1 {
            return bad("leaf_capacity must be in 2..2^29-1".to_string());
        }
        if self.inode_capacity < 2 || self.inode_capacity >= u32::MAX as usize {
            return bad("inode_capacity must be in 2..u32::MAX".to_string());
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all durable regions)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set how persist barriers reach the media
    pub fn durability(mut self, durability: Durability) -> Self {
        self.config.durability = durability;
        self
    }

    /// Set the number of NUMA nodes
    pub fn numa_nodes(mut self, nodes: usize) -> Self {
        self.config.numa_nodes = nodes;
        self
    }

    /// Set the number of durable modules per node
    pub fn modules_per_node(mut self, modules: usize) -> Self {
        self.config.modules_per_node = modules;
        self
    }

    /// Set the number of checkpoint workers per node
    pub fn workers_per_node(mut self, workers: usize) -> Self {
        self.config.workers_per_node = workers;
        self
    }

    /// Set the maximum number of joined threads
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.config.max_threads = threads;
        self
    }

    /// Set the per-lane ring capacity (in records)
    pub fn log_capacity(mut self, records: usize) -> Self {
        self.config.log_capacity = records;
        self
    }

    /// Set the staging watermark (in records)
    pub fn staging_watermark(mut self, records: usize) -> Self {
        self.config.staging_watermark = records;
        self
    }

    /// Set the log write-back strategy
    pub fn log_sync_strategy(mut self, strategy: LogSyncStrategy) -> Self {
        self.config.log_sync_strategy = strategy;
        self
    }

    /// Set the pending-record count that triggers a checkpoint
    pub fn checkpoint_threshold(mut self, records: usize) -> Self {
        self.config.checkpoint_threshold = records;
        self
    }

    /// Enable or disable the background coordinator thread
    pub fn background_checkpoint(mut self, enabled: bool) -> Self {
        self.config.background_checkpoint = enabled;
        self
    }

    /// Set the number of leaf slots per color
    pub fn leaf_capacity(mut self, leaves: usize) -> Self {
        self.config.leaf_capacity = leaves;
        self
    }

    /// Set the number of bridging nodes
    pub fn inode_capacity(mut self, inodes: usize) -> Self {
        self.config.inode_capacity = inodes;
        self
    }

    /// Simulate a crash at the given barrier point
    pub fn crash_point(mut self, point: CrashPoint) -> Self {
        self.config.crash_point = Some(point);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
