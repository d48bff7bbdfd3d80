//! Bridging index ("shim")
//!
//! A sorted chain of small DRAM nodes, each owning a key range
//! `[lfence, rfence)` that together tile the key space. A node buffers
//! references to log records written since the last checkpoint and names the
//! leaf that holds the rest of its range. Reads that miss the node fall
//! through to that leaf.
//!
//! ## Concurrency
//! - Writers crab-lock left to right (`FairMutex` per node).
//! - Readers are lock-free and validate with each node's `SeqCount`.
//! - A node emptied by a checkpoint is marked deleted, unlinked, removed from
//!   the coarse index and retired through QSBR.

mod inode;
mod ops;
mod sync;

pub use inode::{InodeId, INODE_FANOUT};
pub use ops::{ShimLookup, UpsertStatus};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TierError};
use crate::index::{CoarseIndex, ShimRef};
use crate::key::Key;
use crate::leaf::{LeafId, LeafRange};
use crate::sync::{Backoff, FreeList, Qsbr};

use inode::{Inode, InodeView};

/// Items handed to QSBR for deferred reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retired {
    Inode(InodeId),
}

/// Debug view of one bridging node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimRange {
    pub lfence: Key,
    pub rfence: Key,
    pub leaf: LeafId,
    pub buffered: usize,
    pub has_pfence: bool,
}

pub struct Shim {
    inodes: Box<[Inode]>,
    free: FreeList,
    index: Arc<dyn CoarseIndex>,
    head: AtomicU32,
}

impl Shim {
    pub fn new(capacity: usize, index: Arc<dyn CoarseIndex>) -> Self {
        Self {
            inodes: (0..capacity).map(|_| Inode::new()).collect(),
            free: FreeList::full(capacity),
            index,
            head: AtomicU32::new(InodeId::NONE_RAW),
        }
    }

    #[inline]
    pub(crate) fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.index()]
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn alloc(&self) -> Result<InodeId> {
        self.free
            .pop()
            .map(InodeId::new)
            .ok_or(TierError::CapacityExhausted { resource: "inode" })
    }

    /// Return a retired node to the arena. Only after its grace period.
    pub fn reclaim(&self, retired: Retired) {
        match retired {
            Retired::Inode(id) => {
                self.inode(id).generation.fetch_add(1, Ordering::AcqRel);
                self.free.push(id.raw());
            }
        }
    }

    fn head(&self) -> InodeId {
        InodeId::from_raw(self.head.load(Ordering::Acquire))
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Build one node per leaf, each marked as carrying its leaf's point
    /// fence. Used at init and recovery, before any concurrent access.
    pub fn rebuild(&self, chain: &[LeafRange]) -> Result<()> {
        self.index.clear();
        self.free.reset(0..self.inodes.len() as u32);

        let mut ids = Vec::with_capacity(chain.len());
        for _ in chain {
            ids.push(self.alloc()?);
        }
        for (i, range) in chain.iter().enumerate() {
            let next = ids.get(i + 1).copied();
            self.inode(ids[i]).reset(&range.lfence, &range.rfence, next, range.leaf, true);
            self.index.insert(range.lfence, ShimRef::new(ids[i], range.leaf));
        }
        if let Some(&first) = ids.first() {
            self.head.store(first.raw(), Ordering::Release);
        }
        debug!(inodes = ids.len(), "rebuilt bridging index");
        Ok(())
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Starting node for `key` from the coarse index
    fn seek(&self, key: &Key) -> InodeId {
        self.index
            .lookup(key)
            .map(|(_, r)| r.inode())
            .unwrap_or_else(|| self.head())
    }

    /// Validated view of the live node whose range contains `key`
    pub(crate) fn locate(&self, key: &Key) -> (InodeId, InodeView) {
        let mut backoff = Backoff::new();
        'seek: loop {
            let mut cur = self.seek(key);
            loop {
                let node = self.inode(cur);
                let view = node.seq.read(|| node.view());
                if view.deleted {
                    // unlinked but still indexed; the deleter removes it shortly
                    backoff.snooze();
                    continue 'seek;
                }
                if *key >= view.rfence {
                    match view.next {
                        Some(next) => {
                            cur = next;
                            continue;
                        }
                        None => continue 'seek,
                    }
                }
                return (cur, view);
            }
        }
    }

    /// Leaf currently owning `key`
    pub fn leaf_of(&self, key: &Key) -> Option<LeafId> {
        self.locate(key).1.leaf
    }

    /// Nodes in key order, each with the fences it stores (debugging and
    /// tests; not linearizable)
    pub fn ranges(&self) -> Vec<ShimRange> {
        let mut out = Vec::new();
        let mut cur = Some(self.head());
        while let Some(id) = cur {
            let node = self.inode(id);
            let (view, lfence, pfence) = node.seq.read(|| (node.view(), node.lfence(), node.has_pfence()));
            if let Some(leaf) = view.leaf {
                out.push(ShimRange {
                    lfence,
                    rfence: view.rfence,
                    leaf,
                    buffered: view.validmap.count_ones() as usize,
                    has_pfence: pfence,
                });
            }
            if view.rfence.is_max() || out.len() > self.inodes.len() {
                break;
            }
            cur = view.next;
        }
        out
    }

    pub fn index(&self) -> &Arc<dyn CoarseIndex> {
        &self.index
    }

    pub(crate) fn retire(&self, qsbr: &Qsbr<Retired>, id: InodeId) {
        qsbr.retire(Retired::Inode(id));
    }
}
