//! Concurrency primitives
//!
//! - [`SeqCount`]: optimistic single-writer / many-reader metadata access
//! - [`FairMutex`]: MCS queue lock for inodes and leaves
//! - [`Qsbr`]: quiescent-state reclamation with typed deferred items
//! - [`FreeList`]: lock-free index stack backing the arenas

mod fair_mutex;
mod free_list;
mod qsbr;
mod seqcount;

pub use fair_mutex::{FairMutex, FairMutexGuard};
pub use free_list::FreeList;
pub use qsbr::{Qsbr, QsbrGuard};
pub use seqcount::{SeqCount, SeqWriteGuard};

use std::hint;
use std::thread;

/// Spins that precede yielding to the scheduler
const SPIN_LIMIT: u32 = 64;

/// Busy-wait helper: spin briefly, then yield so oversubscribed hosts
/// still make progress.
#[derive(Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            hint::spin_loop();
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}
