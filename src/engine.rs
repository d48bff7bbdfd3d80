//! Engine Module
//!
//! Ties the log, the bridging index and the leaves together.
//!
//! ## Responsibilities
//! - Initialize a fresh data directory or recover an existing one
//! - Hand out per-thread handles (one log lane and one QSBR slot each)
//! - Route reads through the bridging index and fall through to the leaves
//! - Trigger checkpoints: threshold (background), backpressure, explicit,
//!   and close
//!
//! ## Concurrency Model
//!
//! - **Writes** append to the caller's own lane, then upsert the bridging
//!   index under per-node crab locks. Writers on different lanes never share
//!   a lock unless they touch the same bridging node.
//! - **Reads** are lock-free: seqcount-validated views plus QSBR protection
//!   for log records, bridging nodes and replaced leaves.
//! - **Checkpoints** are serialized and run on a persistent worker pool.
//! - A fatal error (capacity exhaustion, a simulated crash, I/O failure)
//!   latches the engine into a failed state; later writes return
//!   `EngineFailed`. Reopening the data directory recovers.

use std::cell::Cell;
use std::fs;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStats, Checkpointer, Stores};
use crate::config::Config;
use crate::error::{Result, TierError};
use crate::index::{BTreeIndex, CoarseIndex};
use crate::key::{Key, Value};
use crate::leaf::{LeafRange, LeafStore};
use crate::log::{LogLayer, OpKind};
use crate::region::{Descriptor, LayoutHeader};
use crate::shim::{Retired, Shim, ShimLookup, ShimRange, UpsertStatus};
use crate::sync::Qsbr;

/// State shared by handles, the coordinator thread and the engine
struct Shared {
    config: Config,
    stores: Arc<Stores>,
    checkpointer: Checkpointer,
    /// Wakes the coordinator; capacity one, extra wakeups are dropped
    trigger: Sender<()>,
    failed: AtomicBool,
}

/// The tiered key-value engine
///
/// `Engine` is `Send + Sync`. Threads that issue many operations should take
/// a [`ThreadHandle`] with [`Engine::thread_join`]; the convenience methods
/// on `Engine` join and leave around every call.
pub struct Engine {
    shared: Arc<Shared>,
    /// Dropping this disconnects the coordinator's shutdown channel
    shutdown: Option<Sender<()>>,
    coordinator: Option<JoinHandle<()>>,
}

impl Engine {
    /// Open or create an engine with the default coarse index
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_index(config, Arc::new(BTreeIndex::new()))
    }

    /// Open with the default config rooted at `path`
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Open or create an engine on top of a caller-supplied coarse index
    ///
    /// On startup:
    /// 1. Validate the config and map every durable region
    /// 2. Fresh directory: write the layout and a sentinel leaf `[MIN, MAX)`
    /// 3. Existing directory: check the layout, walk the leaf chain, replay
    ///    every unconsumed log record and restart the stamp clock
    /// 4. Build one bridging node per leaf and start the coordinator
    pub fn open_with_index(config: Config, index: Arc<dyn CoarseIndex>) -> Result<Self> {
        config.validate()?;
        let dir = config.data_dir.clone();
        fs::create_dir_all(&dir)?;

        let descriptor = Arc::new(Descriptor::open(&dir, config.max_threads, config.durability)?);
        let header = LayoutHeader::from_config(&config);
        let fresh = !descriptor.is_initialized();
        if fresh {
            descriptor.write_layout(&header)?;
        } else {
            descriptor.check_layout(&header)?;
        }

        let log = LogLayer::open(&dir, &config, Arc::clone(&descriptor))?;
        let leaves = LeafStore::open(&dir, &config, Arc::clone(&descriptor))?;
        let chain: Vec<LeafRange> = if fresh {
            leaves.create_sentinel()?;
            leaves.ranges()
        } else {
            leaves.recover_chain()?
        };

        let shim = Shim::new(config.inode_capacity, index);
        shim.rebuild(&chain)?;

        let qsbr = Arc::new(Qsbr::<Retired>::new(config.max_threads + config.worker_count()));
        let stores = Arc::new(Stores {
            log,
            leaves,
            shim,
            qsbr,
        });
        let checkpointer = Checkpointer::new(Arc::clone(&stores), &config)?;

        if fresh {
            descriptor.set_initialized()?;
            info!(dir = %dir.display(), nodes = config.numa_nodes, "created tierkv instance");
        } else {
            let pending = stores.log.pending();
            let stats = checkpointer.replay()?;
            stores.log.set_clock(stats.max_stamp + 1);
            info!(
                dir = %dir.display(),
                leaves = chain.len(),
                pending,
                replayed = stats.ops,
                "recovered tierkv instance"
            );
        }

        let (trigger, wakeups) = channel::bounded(1);
        let shared = Arc::new(Shared {
            config,
            stores,
            checkpointer,
            trigger,
            failed: AtomicBool::new(false),
        });

        let (shutdown, stop) = channel::bounded::<()>(0);
        let coordinator = if shared.config.background_checkpoint {
            let coord = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("tierkv-coordinator".to_string())
                    .spawn(move || coordinate(coord, wakeups, stop))?,
            )
        } else {
            None
        };

        Ok(Self {
            shared,
            shutdown: Some(shutdown),
            coordinator,
        })
    }

    /// Claim a log lane and QSBR slot for the calling thread
    pub fn thread_join(&self) -> Result<ThreadHandle<'_>> {
        let max = self.shared.config.max_threads;
        let lane = self
            .shared
            .stores
            .qsbr
            .register_in(0..max)
            .ok_or(TierError::TooManyThreads { max })?;
        Ok(ThreadHandle {
            shared: &self.shared,
            lane,
            _not_sync: PhantomData,
        })
    }

    // =========================================================================
    // Convenience Operations (transient handle)
    // =========================================================================

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<UpsertStatus> {
        self.thread_join()?.insert(key, value)
    }

    pub fn remove(&self, key: &[u8]) -> Result<UpsertStatus> {
        self.thread_join()?.remove(key)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.thread_join()?.lookup(key)
    }

    pub fn scan(&self, start: &[u8], count: usize) -> Result<Vec<(Bytes, Bytes)>> {
        self.thread_join()?.scan(start, count)
    }

    pub fn scan_range(&self, low: &[u8], high: &[u8], limit: usize) -> Result<Vec<(Bytes, Bytes)>> {
        self.thread_join()?.scan_range(low, high, limit)
    }

    pub fn force_checkpoint(&self) -> Result<CheckpointStats> {
        self.shared.checkpoint()
    }

    /// Run a final checkpoint and shut down
    pub fn close(mut self) -> Result<()> {
        let result = if self.shared.is_failed() {
            Err(TierError::EngineFailed)
        } else {
            self.shared.checkpoint().map(|_| ())
        };
        self.stop_coordinator();
        info!(dir = %self.shared.config.data_dir.display(), ok = result.is_ok(), "closed tierkv instance");
        result
    }

    fn stop_coordinator(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                warn!("checkpoint coordinator exited by panic");
            }
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Bridging nodes in key order
    pub fn shim_ranges(&self) -> Result<Vec<ShimRange>> {
        let handle = self.thread_join()?;
        let _op = self.shared.stores.qsbr.guard(handle.lane);
        Ok(self.shared.stores.shim.ranges())
    }

    /// Durable leaf chain in key order
    pub fn leaf_ranges(&self) -> Vec<LeafRange> {
        self.shared.stores.leaves.ranges()
    }

    /// Log records appended and not yet consumed by a checkpoint
    pub fn pending_records(&self) -> usize {
        self.shared.stores.log.pending()
    }

    /// Checkpoints completed since open, recovery replay included
    pub fn checkpoint_count(&self) -> u64 {
        self.shared.checkpointer.completed()
    }

    /// Whether a fatal error has stopped the engine from accepting writes
    pub fn is_failed(&self) -> bool {
        self.shared.is_failed()
    }

    pub fn data_dir(&self) -> &Path {
        &self.shared.config.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_coordinator();
    }
}

// =============================================================================
// Shared
// =============================================================================

impl Shared {
    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Latch the failed state for fatal errors, passing the error through
    fn fail(&self, e: TierError) -> TierError {
        if e.is_fatal() && !self.failed.swap(true, Ordering::AcqRel) {
            error!(error = %e, "engine failed; writes are disabled until reopen");
        }
        e
    }

    fn checkpoint(&self) -> Result<CheckpointStats> {
        if self.is_failed() {
            return Err(TierError::EngineFailed);
        }
        self.checkpointer.run().map_err(|e| self.fail(e))
    }

    /// Backpressure: make sure `lane` can take one more record
    fn make_room(&self, lane: usize) -> Result<()> {
        for _ in 0..2 {
            if self.stores.log.has_room(lane) {
                return Ok(());
            }
            debug!(lane, "log lane full; checkpointing");
            self.checkpoint()?;
        }
        if self.stores.log.has_room(lane) {
            Ok(())
        } else {
            Err(self.fail(TierError::CapacityExhausted { resource: "log ring" }))
        }
    }

    fn maybe_trigger(&self) {
        if self.config.background_checkpoint && self.stores.log.pending() >= self.config.checkpoint_threshold {
            let _ = self.trigger.try_send(());
        }
    }
}

/// Background coordinator: checkpoint whenever woken, until shutdown
fn coordinate(shared: Arc<Shared>, wakeups: Receiver<()>, stop: Receiver<()>) {
    debug!("checkpoint coordinator started");
    loop {
        select! {
            recv(wakeups) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            recv(stop) -> _ => break,
        }
        if shared.is_failed() || shared.stores.log.pending() < shared.config.checkpoint_threshold {
            continue;
        }
        if let Err(e) = shared.checkpoint() {
            error!(error = %e, "background checkpoint failed");
        }
    }
    debug!("checkpoint coordinator stopped");
}

// =============================================================================
// Thread Handle
// =============================================================================

/// A joined thread: one log lane plus one QSBR slot
///
/// Not `Sync`; each thread joins for itself. Dropping the handle leaves.
pub struct ThreadHandle<'e> {
    shared: &'e Shared,
    lane: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadHandle<'_> {
    /// Log lane (and QSBR slot) owned by this handle
    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<UpsertStatus> {
        self.write(OpKind::Insert, Key::new(key)?, Value::new(value)?)
    }

    /// Record a removal. Removing an absent key is not an error.
    pub fn remove(&self, key: &[u8]) -> Result<UpsertStatus> {
        self.write(OpKind::Remove, Key::new(key)?, Value::EMPTY)
    }

    fn write(&self, kind: OpKind, key: Key, value: Value) -> Result<UpsertStatus> {
        let shared = self.shared;
        if shared.is_failed() {
            return Err(TierError::EngineFailed);
        }
        shared.make_room(self.lane)?;

        let stores = &shared.stores;
        let status = {
            let _op = stores.qsbr.guard(self.lane);
            stores
                .log
                .append(self.lane, kind, key, value)
                .and_then(|rec| stores.shim.upsert(&key, &rec, &stores.log))
        }
        .map_err(|e| shared.fail(e))?;

        shared.maybe_trigger();
        Ok(status)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let key = Key::new(key)?;
        let stores = &self.shared.stores;
        let _op = stores.qsbr.guard(self.lane);
        let value = match stores.shim.lookup(&key, &stores.log)? {
            ShimLookup::Found(value) => Some(value),
            ShimLookup::Removed => None,
            ShimLookup::Leaf(leaf) => stores.leaves.lookup(leaf, &key),
        };
        Ok(value.map(|v| Bytes::copy_from_slice(v.as_bytes())))
    }

    /// Up to `count` live entries with keys `>= start`, in key order
    pub fn scan(&self, start: &[u8], count: usize) -> Result<Vec<(Bytes, Bytes)>> {
        self.scan_keys(&Key::new(start)?, &Key::MAX, count)
    }

    /// Up to `limit` live entries with `low <= key < high`, in key order
    pub fn scan_range(&self, low: &[u8], high: &[u8], limit: usize) -> Result<Vec<(Bytes, Bytes)>> {
        self.scan_keys(&Key::new(low)?, &Key::new(high)?, limit)
    }

    fn scan_keys(&self, low: &Key, high: &Key, limit: usize) -> Result<Vec<(Bytes, Bytes)>> {
        if limit == 0 || low >= high {
            return Ok(Vec::new());
        }
        let stores = &self.shared.stores;
        let _op = stores.qsbr.guard(self.lane);
        let entries = stores.shim.scan(low, high, limit, &stores.log, &stores.leaves)?;
        Ok(entries
            .into_iter()
            .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
            .collect())
    }

    /// Run a checkpoint from this thread
    pub fn force_checkpoint(&self) -> Result<CheckpointStats> {
        self.shared.checkpoint()
    }

    /// Release the lane and slot (same as dropping the handle)
    pub fn leave(self) {}
}

impl Drop for ThreadHandle<'_> {
    fn drop(&mut self) {
        self.shared.stores.qsbr.unregister(self.lane);
    }
}
