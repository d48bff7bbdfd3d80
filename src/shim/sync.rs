//! Post-flush reconciliation of the bridging index with new leaves

use tracing::trace;

use crate::error::Result;
use crate::index::ShimRef;
use crate::key::Key;
use crate::leaf::{LeafBoundaries, LeafId};
use crate::log::LogLayer;
use crate::sync::{FairMutexGuard, Qsbr};

use super::{InodeId, Retired, Shim};

impl Shim {
    /// Bind the nodes covering `[boundaries.leaves[0].0, boundaries.rfence)`
    /// to the leaves that now hold that range.
    ///
    /// Nodes straddling a leaf boundary are split there, and the node
    /// starting at each boundary carries the point fence. Slots whose flip
    /// differs from `current_flip` were just checkpointed and are dropped. An
    /// emptied node without a point fence is unlinked and retired.
    pub fn sync(
        &self,
        current_flip: bool,
        boundaries: &LeafBoundaries,
        log: &LogLayer,
        qsbr: &Qsbr<Retired>,
    ) -> Result<()> {
        let Some(&(low, _)) = boundaries.leaves.first() else {
            return Ok(());
        };
        let high = boundaries.rfence;
        let mut cuts: Vec<Key> = boundaries.leaves.iter().map(|&(k, _)| k).collect();
        cuts.push(high);

        let (mut cur, mut guard) = self.lock_owner(&low);
        let mut prev: Option<(InodeId, FairMutexGuard<'_, ()>)> = None;
        let mut deleted = 0usize;

        loop {
            let node = self.inode(cur);
            let lfence = node.lfence();
            let rfence = node.rfence();

            if let Some(cut) = cuts.iter().find(|&&k| lfence < k && k < rfence).copied() {
                let (right, right_guard) = self.split_locked(cur, &cut, true, log)?;
                trace!(left = ?cur, ?right, ?cut, "split at leaf boundary");
                if cut <= low {
                    // left half lies before the range
                    drop(guard);
                    cur = right;
                    guard = right_guard;
                }
                continue;
            }
            if lfence >= high {
                break;
            }

            let leaf = leaf_for(boundaries, &lfence);
            let pfence = cuts.binary_search(&lfence).is_ok();
            let flips = if current_flip { node.flipmap() } else { !node.flipmap() };
            let keep = node.validmap() & flips;
            {
                let _w = node.seq.write();
                node.set_leaf(leaf);
                node.set_validmap(keep);
                node.set_pfence(pfence);
            }

            let unlink = keep == 0 && !pfence && prev.is_some();
            if unlink {
                if let Some((p, _)) = &prev {
                    let p = self.inode(*p);
                    {
                        let _w = p.seq.write();
                        p.set_next(node.next());
                        p.set_rfence(&rfence);
                    }
                    {
                        let _w = node.seq.write();
                        node.set_deleted(true);
                    }
                }
                self.index.remove(&lfence);
                self.retire(qsbr, cur);
                deleted += 1;
            } else {
                self.index.insert(lfence, ShimRef::new(cur, leaf));
            }

            if rfence >= high {
                break;
            }
            let Some(next) = node.next() else {
                break;
            };
            let next_guard = self.inode(next).lock.lock();
            if unlink {
                drop(guard);
            } else {
                prev = Some((cur, guard));
            }
            cur = next;
            guard = next_guard;
        }

        drop(guard);
        drop(prev);
        if deleted > 0 {
            trace!(deleted, ?low, ?high, "unlinked emptied nodes");
        }
        Ok(())
    }
}

/// Leaf whose range contains `key`, which lies within the boundaries
fn leaf_for(boundaries: &LeafBoundaries, key: &Key) -> LeafId {
    let at = boundaries.leaves.partition_point(|(k, _)| k <= key);
    boundaries.leaves[at.saturating_sub(1)].1
}
