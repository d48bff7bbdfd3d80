//! Lock-free stack of arena indices
//!
//! Links live in a side array indexed by slot, so the list needs no pointers
//! into the arena. The head carries a 32-bit tag bumped on every update to
//! defeat ABA between a pop's read of `next` and its CAS.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const NIL: u32 = u32::MAX;

pub struct FreeList {
    head: AtomicU64,
    next: Box<[AtomicU32]>,
    len: AtomicUsize,
}

#[inline]
fn pack(tag: u64, idx: u32) -> u64 {
    (tag << 32) | idx as u64
}

impl FreeList {
    /// Empty list able to hold indices `0..capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
            next: (0..capacity).map(|_| AtomicU32::new(NIL)).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// List holding every index; pops return them in ascending order
    pub fn full(capacity: usize) -> Self {
        let list = Self::new(capacity);
        for idx in (0..capacity as u32).rev() {
            list.push(idx);
        }
        list
    }

    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, idx: u32) {
        debug_assert!((idx as usize) < self.next.len());
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            self.next[idx as usize].store(head as u32, Ordering::Relaxed);
            let new = pack((head >> 32).wrapping_add(1), idx);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let idx = head as u32;
            if idx == NIL {
                return None;
            }
            let next = self.next[idx as usize].load(Ordering::Relaxed);
            let new = pack((head >> 32).wrapping_add(1), next);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(idx);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Rebuild from scratch. Only valid while no other thread uses the list.
    pub fn reset<I>(&self, free: I)
    where
        I: IntoIterator<Item = u32>,
    {
        self.head.store(pack(0, NIL), Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
        let mut free: Vec<u32> = free.into_iter().collect();
        free.sort_unstable();
        for idx in free.into_iter().rev() {
            self.push(idx);
        }
    }
}
