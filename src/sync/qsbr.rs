//! Quiescent-state based reclamation
//!
//! Every participating thread owns a slot. While it runs an operation the
//! slot holds the global epoch it observed on entry; between operations it
//! holds zero, which counts as a quiescent state. A thread that has joined but
//! sits idle is therefore never waited on.
//!
//! `synchronize` advances the epoch and waits until every slot is quiescent or
//! has entered since the advance. `retire` stamps an item with a fresh epoch;
//! `collect` hands back the items that every in-flight operation has
//! outlived, leaving the caller to free them.

use std::ops::Range;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use super::Backoff;

const QUIESCENT: u64 = 0;

pub struct Qsbr<T> {
    epoch: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<AtomicU64>]>,
    registered: AtomicU64,
    retired: Mutex<Vec<(u64, T)>>,
}

impl<T> Qsbr<T> {
    /// Reclaimer with `slots` thread slots (at most 64)
    pub fn new(slots: usize) -> Self {
        assert!(slots <= 64, "at most 64 qsbr slots");
        Self {
            epoch: CachePadded::new(AtomicU64::new(1)),
            slots: (0..slots)
                .map(|_| CachePadded::new(AtomicU64::new(QUIESCENT)))
                .collect(),
            registered: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Claim a free slot within `range`
    pub fn register_in(&self, range: Range<usize>) -> Option<usize> {
        let mut bits = self.registered.load(Ordering::Acquire);
        loop {
            let slot = range.clone().find(|&s| s < self.slots.len() && bits & (1 << s) == 0)?;
            match self.registered.compare_exchange_weak(
                bits,
                bits | (1 << slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.slots[slot].store(QUIESCENT, Ordering::Release);
                    return Some(slot);
                }
                Err(current) => bits = current,
            }
        }
    }

    pub fn unregister(&self, slot: usize) {
        self.slots[slot].store(QUIESCENT, Ordering::Release);
        self.registered.fetch_and(!(1 << slot), Ordering::AcqRel);
    }

    pub fn is_registered(&self, slot: usize) -> bool {
        self.registered.load(Ordering::Acquire) & (1 << slot) != 0
    }

    // =========================================================================
    // Operation Bracketing
    // =========================================================================

    /// Start an operation on `slot`
    #[inline]
    pub fn enter(&self, slot: usize) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.slots[slot].store(epoch, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Finish an operation: report a quiescent state
    #[inline]
    pub fn exit(&self, slot: usize) {
        self.slots[slot].store(QUIESCENT, Ordering::Release);
    }

    /// Enter `slot` for the lifetime of the returned guard
    #[inline]
    pub fn guard(&self, slot: usize) -> QsbrGuard<'_, T> {
        self.enter(slot);
        QsbrGuard { qsbr: self, slot }
    }

    /// Report a quiescent point inside a long-running sequence
    #[inline]
    pub fn quiescent(&self, slot: usize) {
        self.exit(slot);
        self.enter(slot);
    }

    pub fn is_active(&self, slot: usize) -> bool {
        self.slots[slot].load(Ordering::Acquire) != QUIESCENT
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    // =========================================================================
    // Grace Periods
    // =========================================================================

    /// Wait until every operation that started before this call has finished.
    /// Must not be called from inside an operation.
    pub fn synchronize(&self) {
        let target = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for slot in self.slots.iter() {
            let mut backoff = Backoff::new();
            loop {
                let seen = slot.load(Ordering::SeqCst);
                if seen == QUIESCENT || seen >= target {
                    break;
                }
                backoff.snooze();
            }
        }
    }

    /// Defer `item` until all current operations have finished
    pub fn retire(&self, item: T) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.retired.lock().push((epoch, item));
    }

    /// Items whose grace period has elapsed
    pub fn collect(&self) -> Vec<T> {
        let oldest = self
            .slots
            .iter()
            .map(|s| s.load(Ordering::SeqCst))
            .filter(|&e| e != QUIESCENT)
            .min()
            .unwrap_or(u64::MAX);

        let mut retired = self.retired.lock();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < retired.len() {
            if retired[i].0 <= oldest {
                ready.push(retired.swap_remove(i).1);
            } else {
                i += 1;
            }
        }
        ready
    }

    /// Items still waiting for a grace period
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }
}

/// An operation in progress; exits the slot on drop
pub struct QsbrGuard<'a, T> {
    qsbr: &'a Qsbr<T>,
    slot: usize,
}

impl<T> Drop for QsbrGuard<'_, T> {
    fn drop(&mut self) {
        self.qsbr.exit(self.slot);
    }
}
