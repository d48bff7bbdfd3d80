//! Sequence counter for optimistic reads
//!
//! The counter is odd while a write is in progress. Readers snapshot an even
//! value, read the protected fields, then re-check the counter; a change means
//! the read may be torn and must be retried. Writers must already be
//! serialized (by a lock or a single-owner rule) before taking a write guard.
//!
//! Protected fields are themselves atomics, so a torn read is merely stale,
//! never undefined. Closures passed to [`SeqCount::read`] must tolerate
//! inconsistent values (clamp indices, avoid unbounded loops).

use std::sync::atomic::{fence, AtomicU64, Ordering};

use super::Backoff;

pub struct SeqCount {
    seq: AtomicU64,
}

impl SeqCount {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Wait for an even counter and return it
    #[inline]
    pub fn read_begin(&self) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            let s = self.seq.load(Ordering::Acquire);
            if s & 1 == 0 {
                return s;
            }
            backoff.snooze();
        }
    }

    /// True if a writer ran since `start`
    #[inline]
    pub fn read_retry(&self, start: u64) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) != start
    }

    /// Run `f` until it completes without an intervening write
    #[inline]
    pub fn read<T>(&self, mut f: impl FnMut() -> T) -> T {
        loop {
            let start = self.read_begin();
            let value = f();
            if !self.read_retry(start) {
                return value;
            }
        }
    }

    /// Single optimistic attempt; `None` if a write raced
    #[inline]
    pub fn try_read<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let start = self.seq.load(Ordering::Acquire);
        if start & 1 == 1 {
            return None;
        }
        let value = f();
        (!self.read_retry(start)).then_some(value)
    }

    /// Begin a write. The caller must hold whatever serializes writers.
    #[inline]
    pub fn write(&self) -> SeqWriteGuard<'_> {
        let s = self.seq.load(Ordering::Relaxed);
        debug_assert!(s & 1 == 0, "nested seqcount write");
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        SeqWriteGuard { seq: self }
    }

    /// Begin a write only if no other writer holds the counter
    #[inline]
    pub fn try_write(&self) -> Option<SeqWriteGuard<'_>> {
        let s = self.seq.load(Ordering::Relaxed);
        if s & 1 == 1 {
            return None;
        }
        self.seq
            .compare_exchange(s, s.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        fence(Ordering::Release);
        Some(SeqWriteGuard { seq: self })
    }

    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends the write section on drop
#[must_use = "dropping the guard immediately ends the write section"]
pub struct SeqWriteGuard<'a> {
    seq: &'a SeqCount,
}

impl Drop for SeqWriteGuard<'_> {
    fn drop(&mut self) {
        self.seq.seq.fetch_add(1, Ordering::Release);
    }
}
