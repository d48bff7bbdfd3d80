//! Leaf split and NUMA recoloring

use tracing::trace;

use crate::config::CrashPoint;
use crate::error::{Result, TierError};
use crate::key::Key;

use super::{LeafId, LeafStore};

impl LeafStore {
    /// Rebuild `leaf` as one leaf of `lcolor` (no cut) or as two leaves split
    /// at `cut`, left in `lcolor` and right in `rcolor`. The original is
    /// delay-freed. Returns the new leaves.
    pub fn split_and_recolor(
        &self,
        leaf: LeafId,
        cut: Option<Key>,
        lcolor: usize,
        rcolor: usize,
    ) -> Result<(LeafId, Option<LeafId>)> {
        let meta = self.meta(leaf);
        let _guard = meta.lock.lock();
        let lfence = self.lfence(leaf);
        let rfence = self.rfence(leaf);
        let entries = self.snapshot(leaf);

        let result = match cut {
            Some(cut) => {
                if cut <= lfence || cut >= rfence {
                    return Err(TierError::Corruption(format!(
                        "split cut {:?} outside ({:?}, {:?})",
                        cut, lfence, rfence
                    )));
                }
                let at = entries.partition_point(|e| e.key < cut);
                let left = self.alloc(lcolor)?;
                let right = self.alloc(rcolor)?;
                self.build(left, &lfence, &cut, &entries[..at]);
                self.build(right, &cut, &rfence, &entries[at..]);
                self.chain_and_persist(&[(left, at), (right, entries.len() - at)])?;
                self.crash_check(CrashPoint::AfterSplitBarrier)?;
                self.replace_in_chain(leaf, left, right)?;
                (left, Some(right))
            }
            None => {
                let fresh = self.alloc(lcolor)?;
                self.build(fresh, &lfence, &rfence, &entries);
                self.chain_and_persist(&[(fresh, entries.len())])?;
                self.crash_check(CrashPoint::AfterSplitBarrier)?;
                self.replace_in_chain(leaf, fresh, fresh)?;
                (fresh, None)
            }
        };

        self.crash_check(CrashPoint::AfterSplitPublish)?;
        self.delay_free(leaf);
        trace!(?leaf, ?result, "split/recolored leaf");
        Ok(result)
    }
}
