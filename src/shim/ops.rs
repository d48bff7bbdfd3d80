//! Lookup, upsert and scan over the bridging index

use tracing::trace;

use crate::error::Result;
use crate::index::ShimRef;
use crate::key::{Entry, Key, Value};
use crate::leaf::{LeafId, LeafStore};
use crate::log::{Appended, LogId, LogLayer, LogRecord};
use crate::search;
use crate::sync::{Backoff, FairMutexGuard};

use super::inode::{Inode, InodeView, INODE_FANOUT};
use super::{InodeId, Shim};

/// Outcome of a bridging-index lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimLookup {
    /// Buffered insert
    Found(Value),
    /// Buffered removal
    Removed,
    /// Nothing buffered; the answer is in this leaf
    Leaf(LeafId),
}

/// Whether an upsert filled a new slot or overwrote the key's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    Inserted,
    Updated,
}

impl Shim {
    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn lookup(&self, key: &Key, log: &LogLayer) -> Result<ShimLookup> {
        let (_, view) = self.locate(key);
        match self.find_in_view(&view, key, log)? {
            Some(record) if record.is_remove() => return Ok(ShimLookup::Removed),
            Some(record) => return Ok(ShimLookup::Found(record.value)),
            None => {}
        }
        Ok(ShimLookup::Leaf(view.leaf.unwrap_or_else(unbound_leaf)))
    }

    fn find_in_view(&self, view: &InodeView, key: &Key, log: &LogLayer) -> Result<Option<LogRecord>> {
        let mut candidates = search::match_fingerprints(&view.fps, key.fingerprint()) as u32 & view.validmap;
        while candidates != 0 {
            let slot = candidates.trailing_zeros() as usize;
            candidates &= candidates - 1;
            let record = log.read(LogId::from_raw(view.logs[slot]))?;
            if record.key == *key {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Upsert
    // =========================================================================

    /// Point `key` at an appended record. A slot already holding a newer
    /// record for the key (a racing writer on another lane) is left alone.
    pub fn upsert(&self, key: &Key, rec: &Appended, log: &LogLayer) -> Result<UpsertStatus> {
        let (mut cur, mut guard) = self.lock_owner(key);
        loop {
            let node = self.inode(cur);

            if let Some((slot, stamp)) = self.find_slot_locked(node, key, log)? {
                if stamp < rec.stamp {
                    let _w = node.seq.write();
                    node.set_log(slot, rec.id);
                    node.set_flip(slot, rec.flip);
                }
                return Ok(UpsertStatus::Updated);
            }

            let valid = node.validmap();
            if valid.count_ones() < INODE_FANOUT as u32 {
                let slot = (!valid).trailing_zeros() as usize;
                let _w = node.seq.write();
                node.set_fingerprint(slot, key.fingerprint());
                node.set_log(slot, rec.id);
                node.set_flip(slot, rec.flip);
                node.set_validmap(valid | 1 << slot);
                return Ok(UpsertStatus::Inserted);
            }

            // full: median split, then continue in the half owning the key
            let cut = self.median_key(node, log)?;
            let (right, right_guard) = self.split_locked(cur, &cut, false, log)?;
            trace!(left = ?cur, ?right, ?cut, "overflow split");
            if *key >= cut {
                drop(guard);
                cur = right;
                guard = right_guard;
            } else {
                drop(right_guard);
            }
        }
    }

    /// Lock the live node owning `key`, crabbing right past stale starts
    pub(crate) fn lock_owner(&self, key: &Key) -> (InodeId, FairMutexGuard<'_, ()>) {
        let mut backoff = Backoff::new();
        loop {
            let mut cur = self.seek(key);
            let mut guard = self.inode(cur).lock.lock();
            if self.inode(cur).is_deleted() {
                drop(guard);
                backoff.snooze();
                continue;
            }
            loop {
                let node = self.inode(cur);
                if *key < node.rfence() {
                    return (cur, guard);
                }
                let Some(next) = node.next() else {
                    break;
                };
                let next_guard = self.inode(next).lock.lock();
                drop(guard);
                guard = next_guard;
                cur = next;
            }
            drop(guard);
        }
    }

    /// Slot of `key` in a locked node, with the stamp of its record
    fn find_slot_locked(&self, node: &Inode, key: &Key, log: &LogLayer) -> Result<Option<(usize, u64)>> {
        let fp = key.fingerprint();
        let mut valid = node.validmap();
        while valid != 0 {
            let slot = valid.trailing_zeros() as usize;
            valid &= valid - 1;
            if node.fingerprint(slot) != fp {
                continue;
            }
            let record = log.read(node.log(slot))?;
            if record.key == *key {
                return Ok(Some((slot, record.stamp)));
            }
        }
        Ok(None)
    }

    /// Keys of the live slots of a locked node, with their slots, sorted
    pub(crate) fn sorted_slots(&self, node: &Inode, log: &LogLayer) -> Result<Vec<(Key, usize)>> {
        let mut valid = node.validmap();
        let mut slots = Vec::with_capacity(valid.count_ones() as usize);
        while valid != 0 {
            let slot = valid.trailing_zeros() as usize;
            valid &= valid - 1;
            slots.push((log.read(node.log(slot))?.key, slot));
        }
        slots.sort_unstable();
        Ok(slots)
    }

    fn median_key(&self, node: &Inode, log: &LogLayer) -> Result<Key> {
        let slots = self.sorted_slots(node, log)?;
        Ok(slots[slots.len() / 2].0)
    }

    /// Split locked node `id` at `cut` (strictly inside its range). Slots
    /// with keys `>= cut` move to a new right node, which is returned locked.
    pub(crate) fn split_locked(
        &self,
        id: InodeId,
        cut: &Key,
        pfence: bool,
        log: &LogLayer,
    ) -> Result<(InodeId, FairMutexGuard<'_, ()>)> {
        let node = self.inode(id);
        let right_id = self.alloc()?;
        let right = self.inode(right_id);
        let right_guard = right.lock.lock();

        let leaf = node.leaf().unwrap_or_else(unbound_leaf);
        right.reset(cut, &node.rfence(), node.next(), leaf, pfence);

        let mut moved = 0u32;
        for (key, slot) in self.sorted_slots(node, log)? {
            if key >= *cut {
                right.copy_slot(node, slot);
                moved |= 1 << slot;
            }
        }
        {
            let _w = right.seq.write();
            right.set_flipmap(node.flipmap() & moved);
            right.set_validmap(moved);
        }
        {
            let _w = node.seq.write();
            node.set_validmap(node.validmap() & !moved);
            node.set_rfence(cut);
            node.set_next(Some(right_id));
        }
        self.index.insert(*cut, ShimRef::new(right_id, leaf));
        Ok((right_id, right_guard))
    }

    // =========================================================================
    // Scan
    // =========================================================================

    /// Up to `limit` live entries with `low <= key < high`, in key order.
    /// Buffered records shadow leaf entries; removals hide the key.
    pub fn scan(
        &self,
        low: &Key,
        high: &Key,
        limit: usize,
        log: &LogLayer,
        leaves: &LeafStore,
    ) -> Result<Vec<(Key, Value)>> {
        let mut out = Vec::new();
        let mut cursor = *low;

        while out.len() < limit && cursor < *high {
            let (_, view) = self.locate(&cursor);
            let upper = if view.rfence < *high { view.rfence } else { *high };

            let mut records = Vec::new();
            let mut valid = view.validmap;
            while valid != 0 {
                let slot = valid.trailing_zeros() as usize;
                valid &= valid - 1;
                let record = log.read(LogId::from_raw(view.logs[slot]))?;
                if record.key >= cursor && record.key < upper {
                    records.push(record);
                }
            }
            // a node holds at most one slot per key
            records.sort_unstable_by(|a, b| a.key.cmp(&b.key));

            // after the view: a checkpoint fills the leaf before pruning the node
            let leaf = view.leaf.unwrap_or_else(unbound_leaf);
            let entries = leaves.snapshot_range(leaf, &cursor, &upper);

            merge_into(&mut out, &records, &entries, limit);

            if view.rfence >= *high || view.rfence.is_max() {
                break;
            }
            cursor = view.rfence;
        }
        Ok(out)
    }
}

/// Merge sorted buffered records over sorted leaf entries
fn merge_into(out: &mut Vec<(Key, Value)>, records: &[LogRecord], entries: &[Entry], limit: usize) {
    let mut records = records.iter().peekable();
    let mut entries = entries.iter().peekable();
    while out.len() < limit {
        let from_log = match (records.peek(), entries.peek()) {
            (Some(r), Some(e)) => r.key <= e.key,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if from_log {
            let Some(r) = records.next() else { break };
            // the buffered record shadows the leaf copy
            entries.next_if(|e| e.key == r.key);
            if !r.is_remove() {
                out.push((r.key, r.value));
            }
        } else if let Some(e) = entries.next() {
            out.push((e.key, e.value));
        }
    }
}

/// Placeholder for a node with no leaf bound; live nodes always have one
#[cold]
fn unbound_leaf() -> LeafId {
    LeafId::new(0, 0)
}
