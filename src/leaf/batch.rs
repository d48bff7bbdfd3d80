//! Batched application of checkpointed operations to one leaf

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::config::CrashPoint;
use crate::error::Result;
use crate::key::{Entry, Key, Value};
use crate::log::OpKind;
use crate::region::DurableRegion;
use crate::search;

use super::{LeafId, LeafStore, LEAF_FANOUT};

/// One deduplicated operation destined for a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOp {
    pub key: Key,
    pub value: Value,
    pub kind: OpKind,
}

/// Leaves that now cover the range a batch was applied to: each leaf with
/// its left fence, in key order, and the right fence of the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafBoundaries {
    pub leaves: Vec<(Key, LeafId)>,
    pub rfence: Key,
}

impl LeafStore {
    /// Apply `ops` (sorted by key, one per key, all inside the leaf's range).
    ///
    /// 1. Updates and removes in place, one barrier.
    /// 2. Remaining inserts in place if they fit: entries, barrier, bitmap,
    ///    barrier.
    /// 3. Otherwise prebuild replacement leaves, persist, publish, persist,
    ///    and delay-free the original.
    pub fn run_batch(&self, leaf: LeafId, ops: &[BatchOp]) -> Result<LeafBoundaries> {
        let meta = self.meta(leaf);
        let _guard = meta.lock.lock();
        let lfence = self.lfence(leaf);
        let rfence = self.rfence(leaf);
        debug_assert!(ops.windows(2).all(|w| w[0].key < w[1].key));
        debug_assert!(ops.iter().all(|op| op.key >= lfence && op.key < rfence));

        // ---------------------------------------------------------------------
        // No-SMO pass
        // ---------------------------------------------------------------------
        let old_valid = self.validmap(leaf);
        let mut valid = old_valid;
        let mut changed = Vec::new();
        let mut pending: Vec<Entry> = Vec::new();
        {
            let fps = self.fingerprints(leaf);
            let _w = meta.seq.write();
            for op in ops {
                let slot = self.find_slot(leaf, &fps, valid, &op.key);
                match (op.kind, slot) {
                    (OpKind::Remove, Some(s)) => valid &= !(1u64 << s),
                    (OpKind::Remove, None) => {}
                    (OpKind::Insert, Some(s)) => {
                        self.write_entry(leaf, s, &Entry::new(op.key, op.value));
                        changed.push(s);
                    }
                    (OpKind::Insert, None) => pending.push(Entry::new(op.key, op.value)),
                }
            }
            if valid != old_valid || !changed.is_empty() {
                self.set_validmap(leaf, valid);
                meta.version.fetch_add(1, Ordering::Release);
            }
        }
        for &slot in &changed {
            self.writeback_entry(leaf, slot)?;
        }
        self.writeback_meta(leaf)?;
        DurableRegion::fence();
        self.crash_check(CrashPoint::AfterNoSmoBarrier)?;

        let unchanged = LeafBoundaries {
            leaves: vec![(lfence, leaf)],
            rfence,
        };
        if pending.is_empty() {
            return Ok(unchanged);
        }

        // ---------------------------------------------------------------------
        // In-place inserts
        // ---------------------------------------------------------------------
        if valid.count_ones() as usize + pending.len() <= LEAF_FANOUT {
            let mut added = 0u64;
            {
                let _w = meta.seq.write();
                let mut free = !valid & full_mask();
                for entry in &pending {
                    let slot = free.trailing_zeros() as usize;
                    free &= free - 1;
                    self.write_entry(leaf, slot, entry);
                    self.set_fingerprint(leaf, slot, entry.key.fingerprint());
                    added |= 1 << slot;
                }
                meta.version.fetch_add(1, Ordering::Release);
            }
            let mut bits = added;
            while bits != 0 {
                let slot = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                self.writeback_entry(leaf, slot)?;
            }
            self.writeback_meta(leaf)?;
            DurableRegion::fence();
            self.crash_check(CrashPoint::AfterInplaceEntries)?;

            {
                let _w = meta.seq.write();
                self.set_validmap(leaf, valid | added);
                meta.version.fetch_add(1, Ordering::Release);
            }
            self.writeback_meta(leaf)?;
            DurableRegion::fence();
            return Ok(unchanged);
        }

        // ---------------------------------------------------------------------
        // Prebuild
        // ---------------------------------------------------------------------
        let merged = merge_sorted(self.snapshot(leaf), pending);
        let built = self.prebuild(leaf, &lfence, &rfence, &merged)?;
        trace!(?leaf, entries = merged.len(), leaves = built.len(), "prebuilt leaves");

        self.crash_check(CrashPoint::AfterPrebuildBarrier)?;
        let head = built[0].0;
        let tail = built[built.len() - 1].0;
        self.replace_in_chain(leaf, head, tail)?;
        self.crash_check(CrashPoint::AfterPrebuildPublish)?;
        self.delay_free(leaf);

        let mut leaves = Vec::with_capacity(built.len());
        for (i, &(id, _)) in built.iter().enumerate() {
            leaves.push((if i == 0 { lfence } else { self.lfence(id) }, id));
        }
        Ok(LeafBoundaries { leaves, rfence })
    }

    /// Slot holding `key`, if any
    fn find_slot(&self, leaf: LeafId, fps: &[u8; LEAF_FANOUT], valid: u64, key: &Key) -> Option<usize> {
        let mut candidates = search::match_fingerprints(fps, key.fingerprint()) & valid;
        while candidates != 0 {
            let slot = candidates.trailing_zeros() as usize;
            candidates &= candidates - 1;
            if self.read_entry(leaf, slot).key == *key {
                return Some(slot);
            }
        }
        None
    }

    /// Pack sorted `entries` into fresh, chained, persisted leaves of the
    /// same color, half full except for the last.
    fn prebuild(&self, leaf: LeafId, lfence: &Key, rfence: &Key, entries: &[Entry]) -> Result<Vec<(LeafId, usize)>> {
        let mut chunks: Vec<&[Entry]> = Vec::new();
        let mut rest = entries;
        while !rest.is_empty() {
            let take = if rest.len() >= LEAF_FANOUT { LEAF_FANOUT / 2 } else { rest.len() };
            let (chunk, tail) = rest.split_at(take);
            chunks.push(chunk);
            rest = tail;
        }

        let mut built = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let id = self.alloc(leaf.color())?;
            let lo = if i == 0 { *lfence } else { chunk[0].key };
            let hi = match chunks.get(i + 1) {
                Some(next) => next[0].key,
                None => *rfence,
            };
            self.build(id, &lo, &hi, chunk);
            built.push((id, chunk.len()));
        }
        self.chain_and_persist(&built)?;
        Ok(built)
    }
}

fn full_mask() -> u64 {
    (1u64 << LEAF_FANOUT) - 1
}

/// Merge two key-sorted runs with disjoint keys
pub(crate) fn merge_sorted(a: Vec<Entry>, b: Vec<Entry>) -> Vec<Entry> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.key < y.key,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_a { a.next() } else { b.next() };
        out.extend(next);
    }
    out
}
