//! Checkpoint pipeline
//!
//! Moves buffered log records into the durable leaves and then releases the
//! log space they used.
//!
//! ## Stages
//! ```text
//!   1 flip ─▶ 2 force write-back ─▶ 3 fetch ─▶ 4 cluster ─▶ 5 balance
//!                                                              │
//!                          7 cleanup ◀── 6 flush (run_batch + shim sync)
//! ```
//! Stages 3, 4 and 6 run on the worker pool; the rest run on the calling
//! thread. Replay (recovery) skips 1 and 2 and fetches every unconsumed
//! record. Any error aborts before cleanup, so no cursor moves past records
//! that did not reach the leaves.

mod balance;
mod cluster;
mod fetch;
mod pool;

pub use pool::WorkerPool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::leaf::LeafStore;
use crate::log::LogLayer;
use crate::shim::{Retired, Shim};
use crate::sync::Qsbr;

/// Everything a checkpoint touches, shared with user threads
pub struct Stores {
    pub log: LogLayer,
    pub leaves: LeafStore,
    pub shim: Shim,
    pub qsbr: Arc<Qsbr<Retired>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Live,
    Replay,
}

/// Summary of one completed checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Records fetched from the lanes
    pub records: usize,
    /// Operations left after deduplication
    pub ops: usize,
    /// Leaves written
    pub clusters: usize,
    /// Ops moved to another node by balancing
    pub moved: usize,
    /// Leaves split or recolored by balancing
    pub reshaped: usize,
    /// Highest stamp among the fetched records
    pub max_stamp: u64,
    pub elapsed: Duration,
}

pub struct Checkpointer {
    stores: Arc<Stores>,
    pool: WorkerPool,
    nodes: usize,
    per_node: usize,
    /// Serializes checkpoints
    running: Mutex<()>,
    completed: AtomicU64,
}

impl Checkpointer {
    /// Spawn the worker pool; workers take QSBR slots after the user lanes
    pub fn new(stores: Arc<Stores>, config: &Config) -> Result<Self> {
        let pool = WorkerPool::spawn(
            config.numa_nodes,
            config.workers_per_node,
            Arc::clone(&stores.qsbr),
            config.max_threads,
        )?;
        Ok(Self {
            stores,
            pool,
            nodes: config.numa_nodes,
            per_node: config.workers_per_node,
            running: Mutex::new(()),
            completed: AtomicU64::new(0),
        })
    }

    /// Checkpoints completed since open (replay included)
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Run one checkpoint. The caller must not be inside a QSBR operation.
    pub fn run(&self) -> Result<CheckpointStats> {
        self.execute(Mode::Live)
    }

    /// Apply every unconsumed record (recovery)
    pub fn replay(&self) -> Result<CheckpointStats> {
        self.execute(Mode::Replay)
    }

    fn execute(&self, mode: Mode) -> Result<CheckpointStats> {
        let _running = self.running.lock();
        let began = Instant::now();
        let stores = &self.stores;
        let log = &stores.log;

        // 1-2: flip, wait out in-flight appends, then make every lane durable
        let (fetch_flip, current) = match mode {
            Mode::Live => {
                let previous = log.toggle_flip();
                stores.qsbr.synchronize();
                for lane in 0..log.lane_count() {
                    log.force_write_back(lane)?;
                }
                (Some(previous), !previous)
            }
            Mode::Replay => (None, log.flip()),
        };

        // 3: fetch
        let harvests = fetch::fetch(&self.pool, stores, fetch_flip)?;
        let mut cursors = Vec::new();
        let mut runs = Vec::with_capacity(harvests.len());
        let mut stats = CheckpointStats::default();
        for h in harvests {
            stats.records += h.records.len();
            cursors.extend(h.cursors);
            runs.push(h.records);
        }
        debug!(?mode, records = stats.records, "fetched log records");

        if stats.records > 0 {
            // 4: cluster
            let clustered = cluster::cluster(&self.pool, stores, runs)?;
            stats.max_stamp = clustered.max_stamp;
            stats.clusters = clustered.clusters.len();
            stats.ops = clustered.clusters.iter().map(|c| c.len()).sum();
            debug!(ops = stats.ops, clusters = stats.clusters, "clustered");

            // 5: balance
            let plan = balance::balance(&stores.leaves, clustered.clusters, self.nodes, self.per_node)?;
            stats.moved = plan.moved;
            stats.reshaped = plan.reshaped;
            debug!(moved = plan.moved, reshaped = plan.reshaped, "balanced");

            // 6: flush
            let shared = Arc::clone(stores);
            self.pool.map(plan.per_worker, move |_, clusters| {
                for c in clusters {
                    let boundaries = shared.leaves.run_batch(c.leaf, &c.ops)?;
                    shared.shim.sync(current, &boundaries, &shared.log, &shared.qsbr)?;
                }
                Ok(())
            })?;
        }

        // 7: cleanup
        stores.qsbr.synchronize();
        log.advance(&cursors)?;
        let recycled = stores.leaves.recycle();
        let reclaimed = stores.qsbr.collect();
        let inodes = reclaimed.len();
        for item in reclaimed {
            stores.shim.reclaim(item);
        }

        stats.elapsed = began.elapsed();
        self.completed.fetch_add(1, Ordering::AcqRel);
        debug!(
            ?mode,
            records = stats.records,
            recycled,
            inodes,
            elapsed_us = stats.elapsed.as_micros() as u64,
            "checkpoint complete"
        );
        Ok(stats)
    }
}
