//! Lock-free reads of a single leaf

use std::sync::atomic::Ordering;

use crate::key::{Entry, Key, Value};
use crate::search;

use super::{LeafId, LeafStore, LEAF_FANOUT};

impl LeafStore {
    /// Point lookup inside one leaf
    pub fn lookup(&self, leaf: LeafId, key: &Key) -> Option<Value> {
        let meta = self.meta(leaf);
        let fp = key.fingerprint();
        meta.seq.read(|| {
            let valid = self.validmap(leaf);
            let mut candidates = search::match_fingerprints(&self.fingerprints(leaf), fp) & valid;
            while candidates != 0 {
                let slot = candidates.trailing_zeros() as usize;
                candidates &= candidates - 1;
                let entry = self.read_entry(leaf, slot);
                if entry.key == *key {
                    return Some(entry.value);
                }
            }
            None
        })
    }

    /// Number of valid entries
    pub fn count(&self, leaf: LeafId) -> usize {
        let meta = self.meta(leaf);
        meta.seq.read(|| self.validmap(leaf).count_ones() as usize)
    }

    /// Sorted copy of the leaf's entries.
    ///
    /// The sort order is cached as a slot permutation tagged with the leaf
    /// version it was built from; while the leaf is unchanged a snapshot is a
    /// straight copy in permutation order.
    pub fn snapshot(&self, leaf: LeafId) -> Vec<Entry> {
        let meta = self.meta(leaf);
        loop {
            let start = meta.seq.read_begin();
            let version = meta.version.load(Ordering::Acquire);

            let cached = meta
                .perm_seq
                .try_read(|| {
                    if meta.perm_version.load(Ordering::Acquire) != version {
                        return None;
                    }
                    let len = (meta.perm_len.load(Ordering::Relaxed) as usize).min(LEAF_FANOUT);
                    let mut words = [0u64; super::layout::FGPRT_WORDS];
                    for (w, a) in words.iter_mut().zip(meta.perm.iter()) {
                        *w = a.load(Ordering::Relaxed);
                    }
                    let mut order = [0u8; LEAF_FANOUT];
                    search::unpack_fingerprints(&words, &mut order);
                    Some((order, len))
                })
                .flatten();

            let (entries, order) = match cached {
                Some((order, len)) => {
                    let entries: Vec<Entry> = order[..len]
                        .iter()
                        .map(|&slot| self.read_entry(leaf, (slot as usize).min(LEAF_FANOUT - 1)))
                        .collect();
                    (entries, None)
                }
                None => {
                    let valid = self.validmap(leaf);
                    let mut slots: Vec<(Entry, u8)> = (0..LEAF_FANOUT)
                        .filter(|&s| valid & (1 << s) != 0)
                        .map(|s| (self.read_entry(leaf, s), s as u8))
                        .collect();
                    slots.sort_unstable_by(|a, b| a.0.key.cmp(&b.0.key));
                    let order: Vec<u8> = slots.iter().map(|&(_, s)| s).collect();
                    (slots.into_iter().map(|(e, _)| e).collect(), Some(order))
                }
            };

            if meta.seq.read_retry(start) {
                continue;
            }

            if let Some(order) = order {
                if let Some(_w) = meta.perm_seq.try_write() {
                    let mut bytes = [0u8; super::layout::FGPRT_WORDS * 8];
                    bytes[..order.len()].copy_from_slice(&order);
                    for (i, a) in meta.perm.iter().enumerate() {
                        let mut chunk = [0u8; 8];
                        chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
                        a.store(u64::from_le_bytes(chunk), Ordering::Relaxed);
                    }
                    meta.perm_len.store(order.len() as u64, Ordering::Relaxed);
                    meta.perm_version.store(version, Ordering::Release);
                }
            }
            return entries;
        }
    }

    /// Entries with `low <= key < high`, in key order
    pub fn snapshot_range(&self, leaf: LeafId, low: &Key, high: &Key) -> Vec<Entry> {
        self.snapshot(leaf)
            .into_iter()
            .filter(|e| e.key >= *low && e.key < *high)
            .collect()
    }
}
