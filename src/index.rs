//! Coarse index
//!
//! An ordered map from each bridging node's left fence to a packed reference
//! to that node. Lookups use lower-bound semantics: the entry with the
//! greatest key not above the probe. The map may lag behind splits and
//! deletions; the shim re-verifies whatever it returns.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::key::Key;
use crate::leaf::LeafId;
use crate::shim::InodeId;

/// Inode and leaf ids packed into one word
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShimRef(u64);

impl ShimRef {
    pub fn new(inode: InodeId, leaf: LeafId) -> Self {
        Self(inode.raw() as u64 | (leaf.raw() as u64) << 32)
    }

    pub fn inode(self) -> InodeId {
        InodeId::from_raw(self.0 as u32)
    }

    pub fn leaf(self) -> Option<LeafId> {
        LeafId::from_raw((self.0 >> 32) as u32)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ShimRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShimRef({:?}, {:?})", self.inode(), self.leaf())
    }
}

/// Pluggable ordered map used to find the bridging node for a key
pub trait CoarseIndex: Send + Sync {
    /// Insert or replace
    fn insert(&self, key: Key, value: ShimRef);

    /// Greatest entry with key `<= key`
    fn lookup(&self, key: &Key) -> Option<(Key, ShimRef)>;

    fn remove(&self, key: &Key);

    /// Entries with `low <= key < high`, in order
    fn scan(&self, low: &Key, high: &Key) -> Vec<(Key, ShimRef)>;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default coarse index: a `BTreeMap` behind a read-write lock
#[derive(Default)]
pub struct BTreeIndex {
    map: RwLock<BTreeMap<Key, ShimRef>>,
}

impl BTreeIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoarseIndex for BTreeIndex {
    fn insert(&self, key: Key, value: ShimRef) {
        self.map.write().insert(key, value);
    }

    fn lookup(&self, key: &Key) -> Option<(Key, ShimRef)> {
        self.map
            .read()
            .range((Bound::Unbounded, Bound::Included(*key)))
            .next_back()
            .map(|(k, v)| (*k, *v))
    }

    fn remove(&self, key: &Key) {
        self.map.write().remove(key);
    }

    fn scan(&self, low: &Key, high: &Key) -> Vec<(Key, ShimRef)> {
        if low >= high {
            return Vec::new();
        }
        self.map
            .read()
            .range((Bound::Included(*low), Bound::Excluded(*high)))
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    fn clear(&self) {
        self.map.write().clear();
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}
