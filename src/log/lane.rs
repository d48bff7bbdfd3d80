//! One lane of the log: staging buffer, ring and write-back
//!
//! ## Write-back state machine
//! ```text
//!   Enabled ──owner starts append──▶ Delay ──append done──▶ Enabled
//!                                      │
//!                           coordinator forces
//!                                      ▼
//!                                   Request ──owner writes back, acks──▶ Enabled
//! ```
//! In `Enabled` the coordinator writes back itself under the writer lock.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::sync::SeqCount;

use super::record::RECORD_WORDS;

pub(crate) const WB_ENABLED: u8 = 0;
pub(crate) const WB_DELAY: u8 = 1;
pub(crate) const WB_REQUEST: u8 = 2;

pub(crate) struct LogLane {
    pub(crate) id: usize,
    pub(crate) node: usize,
    /// Word offset of this lane's ring inside its node region
    pub(crate) ring_off: usize,
    pub(crate) capacity: u64,

    /// First unconsumed position (mirrors the descriptor)
    pub(crate) start: AtomicU64,
    /// Position one past the last written-back record (mirrors the descriptor)
    pub(crate) end: AtomicU64,

    pub(crate) staging: Box<[AtomicU64]>,
    pub(crate) staged: AtomicUsize,
    /// Guards the (end, staged) pair across write-backs
    pub(crate) seq: SeqCount,

    /// Serializes the owner's appends against forced write-backs
    pub(crate) writer: Mutex<()>,
    pub(crate) wb_state: AtomicU8,
    pub(crate) wb_done: AtomicBool,
}

impl LogLane {
    pub(crate) fn new(id: usize, node: usize, ring_off: usize, capacity: u64, staging_cap: usize) -> Self {
        Self {
            id,
            node,
            ring_off,
            capacity,
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
            staging: (0..staging_cap * RECORD_WORDS).map(|_| AtomicU64::new(0)).collect(),
            staged: AtomicUsize::new(0),
            seq: SeqCount::new(),
            writer: Mutex::new(()),
            wb_state: AtomicU8::new(WB_ENABLED),
            wb_done: AtomicBool::new(true),
        }
    }

    pub(crate) fn staging_cap(&self) -> usize {
        self.staging.len() / RECORD_WORDS
    }

    #[inline]
    pub(crate) fn staging_slot(&self, idx: usize) -> &[AtomicU64] {
        &self.staging[idx * RECORD_WORDS..(idx + 1) * RECORD_WORDS]
    }

    /// Word offset of ring position `pos` in the node region
    #[inline]
    pub(crate) fn ring_word(&self, pos: u64) -> usize {
        self.ring_off + (pos % self.capacity) as usize * RECORD_WORDS
    }

    /// Records in the ring plus records staged
    pub(crate) fn occupancy(&self) -> u64 {
        self.end.load(Ordering::Acquire) - self.start.load(Ordering::Acquire)
            + self.staged.load(Ordering::Acquire) as u64
    }

    /// Whether one more append is guaranteed to fit in the ring
    pub(crate) fn has_room(&self) -> bool {
        self.occupancy() < self.capacity
    }
}
