//! Per-lane durable log
//!
//! Every joined thread owns a lane. Appends land in the lane's DRAM staging
//! buffer tagged with the current generation (flip) and are written back to
//! the lane's circular durable ring when the buffer reaches its watermark,
//! after every append (`LogSyncStrategy::EveryWrite`), or when the checkpoint
//! coordinator forces it. The descriptor holds each lane's `[start, end)`
//! cursors; advancing `start` is what marks records consumed. All lanes'
//! starts advance in one descriptor commit.
//!
//! ## File Layout
//! ```text
//! log-n{node}.tkv:  [lane ring][lane ring]...   (lanes with lane % nodes == node)
//! ```

mod lane;
mod reader;
mod record;

pub use reader::Fetched;
pub use record::{LogId, LogRecord, OpKind, RECORD_WORDS};

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{Config, CrashPoint, LogSyncStrategy};
use crate::error::{Result, TierError};
use crate::key::{Key, Value};
use crate::region::{Descriptor, DurableRegion};
use crate::sync::Backoff;

use lane::{LogLane, WB_DELAY, WB_ENABLED, WB_REQUEST};

/// Where an appended record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub id: LogId,
    /// Generation the record was tagged with
    pub flip: bool,
    pub stamp: u64,
}

pub struct LogLayer {
    lanes: Box<[LogLane]>,
    /// One region per node
    regions: Vec<DurableRegion>,
    /// Throttles concurrent write-backs into the same node's region
    wb_locks: Vec<Mutex<()>>,
    descriptor: Arc<Descriptor>,
    strategy: LogSyncStrategy,
    watermark: usize,
    flip: AtomicBool,
    clock: AtomicU64,
    /// Appended and not yet consumed, across lanes
    pending: AtomicUsize,
    crash_point: Option<CrashPoint>,
}

impl LogLayer {
    pub fn open(dir: &Path, config: &Config, descriptor: Arc<Descriptor>) -> Result<Self> {
        let nodes = config.numa_nodes;
        let capacity = config.log_capacity as u64;
        let ring_words = config.log_capacity * RECORD_WORDS;

        let mut per_node = vec![0usize; nodes];
        let mut lanes = Vec::with_capacity(config.max_threads);
        for id in 0..config.max_threads {
            let node = id % nodes;
            let ring_off = per_node[node] * ring_words;
            per_node[node] += 1;
            lanes.push(LogLane::new(id, node, ring_off, capacity, config.staging_cap()));
        }

        let mut regions = Vec::with_capacity(nodes);
        for (node, &count) in per_node.iter().enumerate() {
            let path = dir.join(format!("log-n{}.tkv", node));
            let (region, _) = DurableRegion::open(&path, (count * ring_words).max(1), config.durability)?;
            regions.push(region);
        }

        let layer = Self {
            lanes: lanes.into_boxed_slice(),
            regions,
            wb_locks: (0..nodes).map(|_| Mutex::new(())).collect(),
            descriptor,
            strategy: config.log_sync_strategy,
            watermark: config.staging_watermark,
            flip: AtomicBool::new(false),
            clock: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            crash_point: config.crash_point,
        };
        layer.reload_cursors();
        Ok(layer)
    }

    /// Load lane cursors from the descriptor
    pub(crate) fn reload_cursors(&self) {
        let mut pending = 0;
        for lane in self.lanes.iter() {
            let (start, end) = self.descriptor.cursor(lane.id);
            lane.start.store(start, Ordering::Release);
            lane.end.store(end, Ordering::Release);
            lane.staged.store(0, Ordering::Release);
            pending += (end - start) as usize;
        }
        self.pending.store(pending, Ordering::Release);
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_node(&self, lane: usize) -> usize {
        self.lanes[lane].node
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    // =========================================================================
    // Generation & Clock
    // =========================================================================

    pub fn flip(&self) -> bool {
        self.flip.load(Ordering::SeqCst)
    }

    /// Toggle the generation; returns the generation that is now "previous"
    pub fn toggle_flip(&self) -> bool {
        self.flip.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn set_clock(&self, next: u64) {
        self.clock.fetch_max(next, Ordering::AcqRel);
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Whether `lane` can take one more append without overrunning its ring
    pub fn has_room(&self, lane: usize) -> bool {
        self.lanes[lane].has_room()
    }

    /// Append a record to `lane`. Must run inside a QSBR operation so that a
    /// checkpoint's flip cannot overtake it.
    pub fn append(&self, lane: usize, kind: OpKind, key: Key, value: Value) -> Result<Appended> {
        let lane = &self.lanes[lane];
        lane.wb_state.store(WB_DELAY, Ordering::SeqCst);

        let guard = lane.writer.lock();
        let result = self.append_locked(lane, kind, key, value);

        // Delay -> Enabled, unless the coordinator asked for a write-back
        if lane
            .wb_state
            .compare_exchange(WB_DELAY, WB_ENABLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let wb = self.write_back_locked(lane);
            lane.wb_state.store(WB_ENABLED, Ordering::SeqCst);
            lane.wb_done.store(true, Ordering::Release);
            wb?;
        }
        drop(guard);

        if result.is_ok() {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    fn append_locked(&self, lane: &LogLane, kind: OpKind, key: Key, value: Value) -> Result<Appended> {
        if !lane.has_room() {
            return Err(TierError::CapacityExhausted { resource: "log ring" });
        }

        let flip = self.flip();
        let record = LogRecord {
            key,
            value,
            stamp: self.clock.fetch_add(1, Ordering::AcqRel),
            kind,
            flip,
        };

        let idx = lane.staged.load(Ordering::Acquire);
        debug_assert!(idx < lane.staging_cap(), "staging overflow");
        for (slot, word) in lane.staging_slot(idx).iter().zip(record.to_words()) {
            slot.store(word, Ordering::Relaxed);
        }
        let pos = lane.end.load(Ordering::Acquire) + idx as u64;
        lane.staged.store(idx + 1, Ordering::Release);

        let staged = idx + 1;
        if self.strategy == LogSyncStrategy::EveryWrite || staged >= lane.staging_cap() {
            let _node = self.wb_locks[lane.node].lock();
            self.write_back_locked(lane)?;
        } else if staged >= self.watermark {
            if let Some(_node) = self.wb_locks[lane.node].try_lock() {
                self.write_back_locked(lane)?;
            }
        }

        Ok(Appended {
            id: LogId::new(lane.id, pos),
            flip,
            stamp: record.stamp,
        })
    }

    /// Copy the staging buffer into the ring and publish the new end.
    /// Caller holds the lane's writer lock.
    fn write_back_locked(&self, lane: &LogLane) -> Result<()> {
        let staged = lane.staged.load(Ordering::Acquire);
        if staged == 0 {
            return Ok(());
        }
        let end = lane.end.load(Ordering::Acquire);
        let region = &self.regions[lane.node];

        let mut words = [0u64; RECORD_WORDS];
        for idx in 0..staged {
            for (w, a) in words.iter_mut().zip(lane.staging_slot(idx)) {
                *w = a.load(Ordering::Relaxed);
            }
            let off = lane.ring_word(end + idx as u64);
            region.bulk_copy(off, &words);
            region.writeback(off, RECORD_WORDS)?;
        }
        DurableRegion::fence();

        {
            let _w = lane.seq.write();
            lane.end.store(end + staged as u64, Ordering::Release);
            lane.staged.store(0, Ordering::Release);
        }
        self.descriptor.set_end(lane.id, end + staged as u64)
    }

    /// Make every staged record of `lane` durable (checkpoint stage 2)
    pub fn force_write_back(&self, lane: usize) -> Result<()> {
        let lane = &self.lanes[lane];
        lane.wb_done.store(false, Ordering::Release);
        match lane
            .wb_state
            .compare_exchange(WB_DELAY, WB_REQUEST, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                // the owner writes back when its append completes
                let mut backoff = Backoff::new();
                while !lane.wb_done.load(Ordering::Acquire) {
                    backoff.snooze();
                }
                Ok(())
            }
            Err(_) => {
                let _writer = lane.writer.lock();
                let _node = self.wb_locks[lane.node].lock();
                let result = self.write_back_locked(lane);
                lane.wb_done.store(true, Ordering::Release);
                result
            }
        }
    }

    // =========================================================================
    // Consumption
    // =========================================================================

    /// Mark `[start, new_start)` consumed for every `(lane, new_start)`.
    /// Only after a grace period. Either all lanes move or none do.
    pub fn advance(&self, cursors: &[(usize, u64)]) -> Result<()> {
        let moved: Vec<(usize, u64)> = cursors
            .iter()
            .copied()
            .filter(|&(lane, new_start)| new_start > self.lanes[lane].start.load(Ordering::Acquire))
            .collect();
        if moved.is_empty() {
            return Ok(());
        }

        self.descriptor.stage_starts(&moved)?;
        if self.crash_point == Some(CrashPoint::BeforeCursorCommit) {
            return Err(TierError::SimulatedCrash(CrashPoint::BeforeCursorCommit));
        }
        let seq = self.descriptor.commit_starts()?;

        let mut consumed = 0;
        for &(id, new_start) in &moved {
            let old = self.lanes[id].start.swap(new_start, Ordering::AcqRel);
            consumed += (new_start - old) as usize;
        }
        self.pending.fetch_sub(consumed, Ordering::AcqRel);
        debug!(lanes = moved.len(), consumed, seq, "committed log cursors");
        Ok(())
    }
}
