//! Persistent leaf layer
//!
//! Leaves hold the sorted, durable copy of the data. Each leaf covers a key
//! range `[lfence, rfence)`, keeps up to `LEAF_FANOUT` entries in unsorted
//! slots (validity bitmap + fingerprint per slot), and is linked into one
//! durable doubly linked chain ordered by `lfence`.
//!
//! ## Concurrency
//! - Structure (batches, splits) is changed only by checkpoint workers, under
//!   the leaf's `FairMutex`.
//! - Readers go lock-free through the leaf's `SeqCount`.
//! - Relinking the chain takes the short global `list_lock`.
//! - Replaced leaves are delay-freed and recycled after a grace period.

mod batch;
mod layout;
mod node;
mod split;

pub use batch::{BatchOp, LeafBoundaries};
pub use layout::{LeafLayout, BLOCK_WORDS, LEAF_BLOCKS, LEAF_FANOUT};

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{Config, CrashPoint, Durability};
use crate::error::{Result, TierError};
use crate::key::{Entry, Key, ENTRY_WORDS, FENCE_WORDS};
use crate::region::{Descriptor, DurableRegion};
use crate::search;
use crate::sync::{FairMutex, FreeList, SeqCount};

use layout::{FGPRT_WORDS, META_FGPRT, META_LFENCE, META_NEXT, META_PREV, META_RFENCE, META_USED_WORDS, META_VALIDMAP};

// =============================================================================
// Leaf Identifier
// =============================================================================

const BLK_BITS: u32 = 29;
const BLK_MASK: u32 = (1 << BLK_BITS) - 1;

/// Block number (29 bits) and NUMA color (3 bits) of a leaf
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafId(u32);

impl LeafId {
    /// Raw encoding of "no leaf" in durable links
    pub const NONE_RAW: u32 = u32::MAX;

    pub fn new(blk: u32, color: usize) -> Self {
        debug_assert!(blk < BLK_MASK);
        Self(blk | (color as u32) << BLK_BITS)
    }

    pub fn blk(self) -> u32 {
        self.0 & BLK_MASK
    }

    pub fn color(self) -> usize {
        (self.0 >> BLK_BITS) as usize
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(Self(raw))
    }
}

impl fmt::Debug for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Leaf({}@{})", self.blk(), self.color())
    }
}

/// A leaf and the range it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRange {
    pub lfence: Key,
    pub rfence: Key,
    pub leaf: LeafId,
}

// =============================================================================
// Volatile Metadata
// =============================================================================

/// DRAM-side state of one leaf slot
pub(crate) struct LeafMeta {
    lock: FairMutex<()>,
    seq: SeqCount,
    /// Bumped on every mutation and on reuse
    version: AtomicU64,
    perm_seq: SeqCount,
    /// `version` the cached permutation was built from
    perm_version: AtomicU64,
    perm_len: AtomicU64,
    perm: [AtomicU64; FGPRT_WORDS],
}

impl LeafMeta {
    fn new() -> Self {
        Self {
            lock: FairMutex::new(()),
            seq: SeqCount::new(),
            version: AtomicU64::new(1),
            perm_seq: SeqCount::new(),
            perm_version: AtomicU64::new(0),
            perm_len: AtomicU64::new(0),
            perm: Default::default(),
        }
    }
}

// =============================================================================
// Leaf Store
// =============================================================================

pub struct LeafStore {
    layout: LeafLayout,
    /// Indexed by `color * modules + m`
    modules: Vec<DurableRegion>,
    /// Indexed by `color * capacity + blk`
    meta: Box<[LeafMeta]>,
    free: Vec<FreeList>,
    tofree: Mutex<Vec<LeafId>>,
    list_lock: Mutex<()>,
    descriptor: Arc<Descriptor>,
    crash_point: Option<CrashPoint>,
}

impl LeafStore {
    /// Map (or create) every leaf module under `dir`
    pub fn open(dir: &Path, config: &Config, descriptor: Arc<Descriptor>) -> Result<Self> {
        Self::open_with(
            dir,
            LeafLayout::new(config.numa_nodes, config.modules_per_node, config.leaf_capacity),
            config.durability,
            config.crash_point,
            descriptor,
        )
    }

    pub fn open_with(
        dir: &Path,
        layout: LeafLayout,
        durability: Durability,
        crash_point: Option<CrashPoint>,
        descriptor: Arc<Descriptor>,
    ) -> Result<Self> {
        let mut modules = Vec::with_capacity(layout.nodes * layout.modules);
        for color in 0..layout.nodes {
            for m in 0..layout.modules {
                let path = dir.join(format!("leaves-n{}-m{}.tkv", color, m));
                let (region, _) = DurableRegion::open(&path, layout.module_words(), durability)?;
                modules.push(region);
            }
        }

        let meta = (0..layout.nodes * layout.capacity).map(|_| LeafMeta::new()).collect();
        let free = (0..layout.nodes).map(|_| FreeList::full(layout.capacity)).collect();

        Ok(Self {
            layout,
            modules,
            meta,
            free,
            tofree: Mutex::new(Vec::new()),
            list_lock: Mutex::new(()),
            descriptor,
            crash_point,
        })
    }

    pub fn layout(&self) -> &LeafLayout {
        &self.layout
    }

    pub fn colors(&self) -> usize {
        self.layout.nodes
    }

    /// Free leaf slots of `color`
    pub fn free_count(&self, color: usize) -> usize {
        self.free[color].len()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub fn alloc(&self, color: usize) -> Result<LeafId> {
        let blk = self.free[color]
            .pop()
            .ok_or(TierError::CapacityExhausted { resource: "leaf" })?;
        let leaf = LeafId::new(blk, color);
        let meta = self.meta(leaf);
        let _w = meta.seq.write();
        meta.version.fetch_add(1, Ordering::Release);
        Ok(leaf)
    }

    /// Queue a replaced leaf; it is recycled after the next grace period
    pub fn delay_free(&self, leaf: LeafId) {
        self.tofree.lock().push(leaf);
    }

    /// Return delay-freed leaves to their free lists. The caller must have
    /// waited for a grace period since they were unlinked.
    pub fn recycle(&self) -> usize {
        let leaves = std::mem::take(&mut *self.tofree.lock());
        for leaf in &leaves {
            self.free[leaf.color()].push(leaf.blk());
        }
        leaves.len()
    }

    // =========================================================================
    // Word Access
    // =========================================================================

    #[inline]
    pub(crate) fn meta(&self, leaf: LeafId) -> &LeafMeta {
        &self.meta[leaf.color() * self.layout.capacity + leaf.blk() as usize]
    }

    #[inline]
    fn block(&self, leaf: LeafId, block: usize) -> (&DurableRegion, usize) {
        let (module, off) = self.layout.locate(leaf, block);
        (&self.modules[module], off)
    }

    #[inline]
    fn meta_word(&self, leaf: LeafId, word: usize) -> &AtomicU64 {
        let (region, off) = self.block(leaf, 0);
        region.word(off + word)
    }

    #[inline]
    fn entry_words(&self, leaf: LeafId, slot: usize) -> &[AtomicU64] {
        let (block, within) = LeafLayout::entry_block(slot);
        let (region, off) = self.block(leaf, block);
        &region.words()[off + within..off + within + ENTRY_WORDS]
    }

    pub(crate) fn read_entry(&self, leaf: LeafId, slot: usize) -> Entry {
        let mut words = [0u64; ENTRY_WORDS];
        for (w, a) in words.iter_mut().zip(self.entry_words(leaf, slot)) {
            *w = a.load(Ordering::Relaxed);
        }
        Entry::from_words(&words)
    }

    pub(crate) fn write_entry(&self, leaf: LeafId, slot: usize, entry: &Entry) {
        for (a, w) in self.entry_words(leaf, slot).iter().zip(entry.to_words()) {
            a.store(w, Ordering::Relaxed);
        }
    }

    pub(crate) fn writeback_entry(&self, leaf: LeafId, slot: usize) -> Result<()> {
        let (block, within) = LeafLayout::entry_block(slot);
        let (region, off) = self.block(leaf, block);
        region.writeback(off + within, ENTRY_WORDS)
    }

    pub(crate) fn writeback_meta(&self, leaf: LeafId) -> Result<()> {
        let (region, off) = self.block(leaf, 0);
        region.writeback(off, META_USED_WORDS)
    }

    /// Write back every block of a freshly built leaf
    pub(crate) fn writeback_leaf(&self, leaf: LeafId, entries: usize) -> Result<()> {
        self.writeback_meta(leaf)?;
        let blocks = entries.div_ceil(layout::ENTRIES_PER_BLOCK);
        for block in 1..=blocks {
            let (region, off) = self.block(leaf, block);
            region.writeback(off, BLOCK_WORDS)?;
        }
        Ok(())
    }

    pub(crate) fn validmap(&self, leaf: LeafId) -> u64 {
        self.meta_word(leaf, META_VALIDMAP).load(Ordering::Acquire)
    }

    pub(crate) fn set_validmap(&self, leaf: LeafId, map: u64) {
        self.meta_word(leaf, META_VALIDMAP).store(map, Ordering::Release);
    }

    pub(crate) fn fingerprints(&self, leaf: LeafId) -> [u8; LEAF_FANOUT] {
        let mut words = [0u64; FGPRT_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.meta_word(leaf, META_FGPRT + i).load(Ordering::Relaxed);
        }
        let mut fps = [0u8; LEAF_FANOUT];
        search::unpack_fingerprints(&words, &mut fps);
        fps
    }

    pub(crate) fn set_fingerprint(&self, leaf: LeafId, slot: usize, fp: u8) {
        let word = self.meta_word(leaf, META_FGPRT + slot / 8);
        let old = word.load(Ordering::Relaxed);
        word.store(search::set_fingerprint(old, slot, fp), Ordering::Relaxed);
    }

    fn load_fence(&self, leaf: LeafId, base: usize) -> Key {
        let mut words = [0u64; FENCE_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.meta_word(leaf, base + i).load(Ordering::Acquire);
        }
        Key::from_fence_words(&words)
    }

    fn store_fence(&self, leaf: LeafId, base: usize, key: &Key) {
        for (i, w) in key.to_fence_words().into_iter().enumerate() {
            self.meta_word(leaf, base + i).store(w, Ordering::Release);
        }
    }

    pub fn lfence(&self, leaf: LeafId) -> Key {
        self.load_fence(leaf, META_LFENCE)
    }

    pub fn rfence(&self, leaf: LeafId) -> Key {
        self.load_fence(leaf, META_RFENCE)
    }

    pub fn next(&self, leaf: LeafId) -> Option<LeafId> {
        LeafId::from_raw(self.meta_word(leaf, META_NEXT).load(Ordering::Acquire) as u32)
    }

    pub fn prev(&self, leaf: LeafId) -> Option<LeafId> {
        LeafId::from_raw(self.meta_word(leaf, META_PREV).load(Ordering::Acquire) as u32)
    }

    fn set_next(&self, leaf: LeafId, next: Option<LeafId>) {
        let raw = next.map_or(LeafId::NONE_RAW, LeafId::raw);
        self.meta_word(leaf, META_NEXT).store(raw as u64, Ordering::Release);
    }

    fn set_prev(&self, leaf: LeafId, prev: Option<LeafId>) {
        let raw = prev.map_or(LeafId::NONE_RAW, LeafId::raw);
        self.meta_word(leaf, META_PREV).store(raw as u64, Ordering::Release);
    }

    // =========================================================================
    // Building & Linking
    // =========================================================================

    /// Fill an unpublished leaf with sorted `entries`. Not persisted.
    pub(crate) fn build(&self, leaf: LeafId, lfence: &Key, rfence: &Key, entries: &[Entry]) {
        debug_assert!(entries.len() <= LEAF_FANOUT);
        let meta = self.meta(leaf);
        let _w = meta.seq.write();
        for (slot, entry) in entries.iter().enumerate() {
            self.write_entry(leaf, slot, entry);
            self.set_fingerprint(leaf, slot, entry.key.fingerprint());
        }
        let map = if entries.len() == 64 { u64::MAX } else { (1u64 << entries.len()) - 1 };
        self.set_validmap(leaf, map);
        self.store_fence(leaf, META_LFENCE, lfence);
        self.store_fence(leaf, META_RFENCE, rfence);
        self.set_next(leaf, None);
        self.set_prev(leaf, None);
        meta.version.fetch_add(1, Ordering::Release);
    }

    /// Chain `leaves` together (unpublished) and persist them
    pub(crate) fn chain_and_persist(&self, leaves: &[(LeafId, usize)]) -> Result<()> {
        for pair in leaves.windows(2) {
            self.set_next(pair[0].0, Some(pair[1].0));
            self.set_prev(pair[1].0, Some(pair[0].0));
        }
        for &(leaf, entries) in leaves {
            self.writeback_leaf(leaf, entries)?;
        }
        DurableRegion::fence();
        Ok(())
    }

    /// Swap `old` for the already persisted chain `head..=tail`.
    ///
    /// The predecessor's `next` (or the descriptor head) is the single
    /// publishing store; everything before it is invisible after a crash.
    pub(crate) fn replace_in_chain(&self, old: LeafId, head: LeafId, tail: LeafId) -> Result<()> {
        let _list = self.list_lock.lock();
        let prev = self.prev(old);
        let next = self.next(old);

        self.set_prev(head, prev);
        self.set_next(tail, next);
        self.writeback_meta(head)?;
        self.writeback_meta(tail)?;
        DurableRegion::fence();

        match prev {
            Some(p) => {
                self.set_next(p, Some(head));
                self.writeback_meta(p)?;
                DurableRegion::fence();
            }
            None => self.descriptor.set_head(head.raw())?,
        }

        if let Some(n) = next {
            self.set_prev(n, Some(tail));
            self.writeback_meta(n)?;
            DurableRegion::fence();
        }
        Ok(())
    }

    pub(crate) fn crash_check(&self, point: CrashPoint) -> Result<()> {
        if self.crash_point == Some(point) {
            return Err(TierError::SimulatedCrash(point));
        }
        Ok(())
    }

    /// Allocate and publish the single leaf covering the whole key space
    pub fn create_sentinel(&self) -> Result<LeafId> {
        let leaf = self.alloc(0)?;
        self.build(leaf, &Key::MIN, &Key::MAX, &[]);
        self.chain_and_persist(&[(leaf, 0)])?;
        self.descriptor.set_head(leaf.raw())?;
        debug!(?leaf, "created sentinel leaf");
        Ok(leaf)
    }

    // =========================================================================
    // Chain Walk & Recovery
    // =========================================================================

    pub fn head(&self) -> Option<LeafId> {
        LeafId::from_raw(self.descriptor.head())
    }

    /// Current chain in key order
    pub fn ranges(&self) -> Vec<LeafRange> {
        let _list = self.list_lock.lock();
        let mut out = Vec::new();
        let mut cur = self.head();
        while let Some(leaf) = cur {
            out.push(LeafRange {
                lfence: self.lfence(leaf),
                rfence: self.rfence(leaf),
                leaf,
            });
            if out.len() > self.meta.len() {
                break;
            }
            cur = self.next(leaf);
        }
        out
    }

    /// Walk the durable chain after a restart: verify that it tiles the key
    /// space, repair `prev` links and rebuild the free lists.
    pub fn recover_chain(&self) -> Result<Vec<LeafRange>> {
        let mut chain: Vec<LeafRange> = Vec::new();
        let mut seen = HashSet::new();
        let mut expected_lfence = Key::MIN;
        let mut prev: Option<LeafId> = None;
        let mut cur = self.head();

        while let Some(leaf) = cur {
            if leaf.color() >= self.layout.nodes || leaf.blk() as usize >= self.layout.capacity {
                return Err(TierError::Corruption(format!("leaf id out of range: {:?}", leaf)));
            }
            if !seen.insert(leaf) {
                return Err(TierError::Corruption(format!("leaf chain cycle at {:?}", leaf)));
            }

            let lfence = self.lfence(leaf);
            let rfence = self.rfence(leaf);
            if lfence != expected_lfence || lfence >= rfence {
                return Err(TierError::Corruption(format!(
                    "leaf {:?} covers [{:?}, {:?}), expected lfence {:?}",
                    leaf, lfence, rfence, expected_lfence
                )));
            }

            self.set_prev(leaf, prev);
            chain.push(LeafRange { lfence, rfence, leaf });
            expected_lfence = rfence;
            prev = Some(leaf);
            cur = self.next(leaf);
        }

        if chain.is_empty() || !expected_lfence.is_max() {
            return Err(TierError::Corruption("leaf chain does not reach MAX".to_string()));
        }

        for color in 0..self.layout.nodes {
            let used: HashSet<u32> = seen.iter().filter(|l| l.color() == color).map(|l| l.blk()).collect();
            self.free[color].reset((0..self.layout.capacity as u32).filter(|b| !used.contains(b)));
        }

        info!(leaves = chain.len(), "recovered leaf chain");
        Ok(chain)
    }
}
