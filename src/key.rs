//! Keys, values and their fixed-width word encodings
//!
//! Both the log and the leaves store entries as eight little-endian words so
//! that every durable write is a word-sized atomic store:
//!
//! ```text
//! word:  0    1    2    3                     4    5    6    7
//!       [key bytes 0..24][key_len | val_len<<8][value bytes 0..32]
//! ```

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, TierError};

/// Longest key accepted by the engine
pub const MAX_KEY_LEN: usize = 24;

/// Longest value stored inline
pub const MAX_VALUE_LEN: usize = 32;

/// Words in an encoded entry
pub const ENTRY_WORDS: usize = 8;

/// Words in an encoded fence key (three key words plus the length)
pub const FENCE_WORDS: usize = 4;

const KEY_WORDS: usize = 3;
const VALUE_WORDS: usize = 4;
const MAX_SENTINEL_LEN: u8 = 0xFF;

// =============================================================================
// Key
// =============================================================================

/// An ordered byte key of at most `MAX_KEY_LEN` bytes
///
/// `Key::MIN` (the empty key) sorts first; `Key::MAX` is a sentinel above
/// every real key and only appears as a right fence.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    len: u8,
    bytes: [u8; MAX_KEY_LEN],
}

impl Key {
    pub const MIN: Key = Key {
        len: 0,
        bytes: [0; MAX_KEY_LEN],
    };

    pub const MAX: Key = Key {
        len: MAX_SENTINEL_LEN,
        bytes: [0xFF; MAX_KEY_LEN],
    };

    /// Build a key from user bytes
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_KEY_LEN {
            return Err(TierError::KeyTooLong {
                len: bytes.len(),
                max: MAX_KEY_LEN,
            });
        }
        let mut buf = [0u8; MAX_KEY_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    /// Big-endian encoding, so numeric order matches key order
    pub fn from_u64(n: u64) -> Self {
        let mut buf = [0u8; MAX_KEY_LEN];
        buf[..8].copy_from_slice(&n.to_be_bytes());
        Self { len: 8, bytes: buf }
    }

    pub fn is_max(&self) -> bool {
        self.len == MAX_SENTINEL_LEN
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.is_max() {
            &self.bytes
        } else {
            &self.bytes[..self.len as usize]
        }
    }

    /// Inverse of `from_u64` for 8-byte keys
    pub fn to_u64(&self) -> Option<u64> {
        if self.len != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[..8]);
        Some(u64::from_be_bytes(buf))
    }

    /// One-byte hash used to prune candidates before a full compare
    pub fn fingerprint(&self) -> u8 {
        let mut h: u32 = self.len as u32;
        for &b in self.as_bytes() {
            h = h.wrapping_mul(37).wrapping_add(b as u32);
        }
        let fp = (h ^ (h >> 8) ^ (h >> 16) ^ (h >> 24)) as u8;
        // 0xFF marks an unused fingerprint lane
        if fp == 0xFF {
            0
        } else {
            fp
        }
    }

    fn key_words(&self) -> [u64; KEY_WORDS] {
        let mut words = [0u64; KEY_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&self.bytes[i * 8..i * 8 + 8]);
            *w = u64::from_le_bytes(chunk);
        }
        words
    }

    fn from_key_words(words: &[u64], len: u8) -> Self {
        let mut bytes = [0u8; MAX_KEY_LEN];
        for i in 0..KEY_WORDS {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&words[i].to_le_bytes());
        }
        if len != MAX_SENTINEL_LEN && (len as usize) <= MAX_KEY_LEN {
            bytes[len as usize..].fill(0);
        }
        Self { len, bytes }
    }

    /// Encoding used for leaf and inode fences
    pub fn to_fence_words(&self) -> [u64; FENCE_WORDS] {
        let k = self.key_words();
        [k[0], k[1], k[2], self.len as u64]
    }

    pub fn from_fence_words(words: &[u64]) -> Self {
        Self::from_key_words(&words[..KEY_WORDS], words[KEY_WORDS] as u8)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_max(), other.is_max()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.as_bytes().cmp(other.as_bytes()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            return write!(f, "Key(MAX)");
        }
        if let Some(n) = self.to_u64() {
            return write!(f, "Key({})", n);
        }
        write!(f, "Key({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

// =============================================================================
// Value
// =============================================================================

/// An inline value of at most `MAX_VALUE_LEN` bytes
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value {
    len: u8,
    bytes: [u8; MAX_VALUE_LEN],
}

impl Value {
    pub const EMPTY: Value = Value {
        len: 0,
        bytes: [0; MAX_VALUE_LEN],
    };

    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_VALUE_LEN {
            return Err(TierError::ValueTooLong {
                len: bytes.len(),
                max: MAX_VALUE_LEN,
            });
        }
        let mut buf = [0u8; MAX_VALUE_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

// =============================================================================
// Entry
// =============================================================================

/// A key/value pair in its durable form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
}

impl Entry {
    pub fn new(key: Key, value: Value) -> Self {
        Self { key, value }
    }

    pub fn to_words(&self) -> [u64; ENTRY_WORDS] {
        let k = self.key.key_words();
        let mut words = [0u64; ENTRY_WORDS];
        words[..KEY_WORDS].copy_from_slice(&k);
        words[KEY_WORDS] = self.key.len as u64 | (self.value.len as u64) << 8;
        for i in 0..VALUE_WORDS {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&self.value.bytes[i * 8..i * 8 + 8]);
            words[KEY_WORDS + 1 + i] = u64::from_le_bytes(chunk);
        }
        words
    }

    /// Decode an entry. Lengths are clamped so torn optimistic reads never
    /// index out of bounds; callers validate with a sequence counter.
    pub fn from_words(words: &[u64]) -> Self {
        let meta = words[KEY_WORDS];
        let key_len = ((meta & 0xFF) as usize).min(MAX_KEY_LEN) as u8;
        let val_len = (((meta >> 8) & 0xFF) as usize).min(MAX_VALUE_LEN) as u8;
        let key = Key::from_key_words(&words[..KEY_WORDS], key_len);
        let mut bytes = [0u8; MAX_VALUE_LEN];
        for i in 0..VALUE_WORDS {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&words[KEY_WORDS + 1 + i].to_le_bytes());
        }
        bytes[val_len as usize..].fill(0);
        Self {
            key,
            value: Value {
                len: val_len,
                bytes,
            },
        }
    }
}
