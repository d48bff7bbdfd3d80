//! Bridging node storage
//!
//! Every field is an atomic so optimistic readers never race with writers in
//! the language sense; consistency comes from the node's `SeqCount`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::key::{Key, FENCE_WORDS};
use crate::leaf::LeafId;
use crate::log::LogId;
use crate::search;
use crate::sync::{FairMutex, SeqCount};

/// Slots per bridging node
pub const INODE_FANOUT: usize = 16;

const FULL_MAP: u32 = (1 << INODE_FANOUT) - 1;

/// Index of a node in the inode arena
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(u32);

impl InodeId {
    pub const NONE_RAW: u32 = u32::MAX;

    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inode({})", self.0)
    }
}

pub(crate) struct Inode {
    pub(crate) lock: FairMutex<()>,
    pub(crate) seq: SeqCount,
    validmap: AtomicU32,
    /// Generation flip of each slot's record
    flipmap: AtomicU32,
    has_pfence: AtomicBool,
    deleted: AtomicBool,
    next: AtomicU32,
    leaf: AtomicU32,
    fgprt: [AtomicU64; 2],
    lfence: [AtomicU64; FENCE_WORDS],
    rfence: [AtomicU64; FENCE_WORDS],
    logs: [AtomicU64; INODE_FANOUT],
    /// Bumped every time the slot is freed
    pub(crate) generation: AtomicU32,
}

/// A validated copy of the fields an optimistic reader needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct InodeView {
    pub(crate) deleted: bool,
    pub(crate) rfence: Key,
    pub(crate) next: Option<InodeId>,
    pub(crate) leaf: Option<LeafId>,
    pub(crate) validmap: u32,
    pub(crate) fps: [u8; INODE_FANOUT],
    pub(crate) logs: [u64; INODE_FANOUT],
}

impl Inode {
    pub(crate) fn new() -> Self {
        Self {
            lock: FairMutex::new(()),
            seq: SeqCount::new(),
            validmap: AtomicU32::new(0),
            flipmap: AtomicU32::new(0),
            has_pfence: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            next: AtomicU32::new(InodeId::NONE_RAW),
            leaf: AtomicU32::new(LeafId::NONE_RAW),
            fgprt: Default::default(),
            lfence: Default::default(),
            rfence: Default::default(),
            logs: Default::default(),
            generation: AtomicU32::new(0),
        }
    }

    /// Unsynchronized snapshot; pair with `seq` to validate
    pub(crate) fn view(&self) -> InodeView {
        let mut fps = [0u8; INODE_FANOUT];
        let words = [
            self.fgprt[0].load(Ordering::Relaxed),
            self.fgprt[1].load(Ordering::Relaxed),
        ];
        search::unpack_fingerprints(&words, &mut fps);
        let mut logs = [0u64; INODE_FANOUT];
        for (l, a) in logs.iter_mut().zip(self.logs.iter()) {
            *l = a.load(Ordering::Relaxed);
        }
        InodeView {
            deleted: self.is_deleted(),
            rfence: self.rfence(),
            next: self.next(),
            leaf: self.leaf(),
            validmap: self.validmap(),
            fps,
            logs,
        }
    }

    // =========================================================================
    // Field Access
    // =========================================================================

    pub(crate) fn validmap(&self) -> u32 {
        self.validmap.load(Ordering::Acquire)
    }

    pub(crate) fn set_validmap(&self, map: u32) {
        self.validmap.store(map & FULL_MAP, Ordering::Release);
    }

    pub(crate) fn flipmap(&self) -> u32 {
        self.flipmap.load(Ordering::Acquire)
    }

    pub(crate) fn set_flip(&self, slot: usize, flip: bool) {
        let map = self.flipmap();
        let map = if flip { map | 1 << slot } else { map & !(1 << slot) };
        self.flipmap.store(map, Ordering::Release);
    }

    pub(crate) fn set_flipmap(&self, map: u32) {
        self.flipmap.store(map, Ordering::Release);
    }

    pub(crate) fn has_pfence(&self) -> bool {
        self.has_pfence.load(Ordering::Acquire)
    }

    pub(crate) fn set_pfence(&self, value: bool) {
        self.has_pfence.store(value, Ordering::Release);
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn set_deleted(&self, value: bool) {
        self.deleted.store(value, Ordering::Release);
    }

    pub(crate) fn next(&self) -> Option<InodeId> {
        let raw = self.next.load(Ordering::Acquire);
        (raw != InodeId::NONE_RAW).then_some(InodeId(raw))
    }

    pub(crate) fn set_next(&self, next: Option<InodeId>) {
        let raw = next.map_or(InodeId::NONE_RAW, InodeId::raw);
        self.next.store(raw, Ordering::Release);
    }

    pub(crate) fn leaf(&self) -> Option<LeafId> {
        LeafId::from_raw(self.leaf.load(Ordering::Acquire))
    }

    pub(crate) fn set_leaf(&self, leaf: LeafId) {
        self.leaf.store(leaf.raw(), Ordering::Release);
    }

    pub(crate) fn fingerprint(&self, slot: usize) -> u8 {
        (self.fgprt[slot / 8].load(Ordering::Relaxed) >> ((slot % 8) * 8)) as u8
    }

    pub(crate) fn set_fingerprint(&self, slot: usize, fp: u8) {
        let word = &self.fgprt[slot / 8];
        word.store(search::set_fingerprint(word.load(Ordering::Relaxed), slot, fp), Ordering::Relaxed);
    }

    pub(crate) fn log(&self, slot: usize) -> LogId {
        LogId::from_raw(self.logs[slot].load(Ordering::Acquire))
    }

    pub(crate) fn set_log(&self, slot: usize, id: LogId) {
        self.logs[slot].store(id.raw(), Ordering::Release);
    }

    fn load_key(words: &[AtomicU64; FENCE_WORDS]) -> Key {
        let mut raw = [0u64; FENCE_WORDS];
        for (r, a) in raw.iter_mut().zip(words.iter()) {
            *r = a.load(Ordering::Acquire);
        }
        Key::from_fence_words(&raw)
    }

    fn store_key(words: &[AtomicU64; FENCE_WORDS], key: &Key) {
        for (a, w) in words.iter().zip(key.to_fence_words()) {
            a.store(w, Ordering::Release);
        }
    }

    pub(crate) fn lfence(&self) -> Key {
        Self::load_key(&self.lfence)
    }

    pub(crate) fn rfence(&self) -> Key {
        Self::load_key(&self.rfence)
    }

    pub(crate) fn set_rfence(&self, key: &Key) {
        Self::store_key(&self.rfence, key);
    }

    /// Reset an unpublished node to cover `[lfence, rfence)` with no slots
    pub(crate) fn reset(&self, lfence: &Key, rfence: &Key, next: Option<InodeId>, leaf: LeafId, pfence: bool) {
        let _w = self.seq.write();
        Self::store_key(&self.lfence, lfence);
        Self::store_key(&self.rfence, rfence);
        self.set_next(next);
        self.set_leaf(leaf);
        self.set_pfence(pfence);
        self.set_deleted(false);
        self.set_validmap(0);
        self.set_flipmap(0);
    }

    /// Copy slot `slot` from `other` into the same slot of `self`
    pub(crate) fn copy_slot(&self, other: &Inode, slot: usize) {
        self.set_fingerprint(slot, other.fingerprint(slot));
        self.set_log(slot, other.log(slot));
    }
}
