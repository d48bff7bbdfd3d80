//! Operation records
//!
//! A record is ten words: the eight entry words, the logical timestamp and a
//! tag word.
//!
//! ```text
//! tag: [ 0x5A (bits 8..16) | kind (bits 1..3) | flip (bit 0) ]
//! ```
//!
//! A zeroed slot never carries the `0x5A` marker, so unwritten ring space
//! never decodes as a record.

use std::fmt;

use crate::key::{Entry, Key, Value, ENTRY_WORDS};

pub const RECORD_WORDS: usize = ENTRY_WORDS + 2;

const TAG_MARKER: u64 = 0x5A << 8;
const TAG_MARKER_MASK: u64 = 0xFF << 8;
const KIND_SHIFT: u64 = 1;
const KIND_MASK: u64 = 0b11 << KIND_SHIFT;

/// What a record does to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Remove,
}

impl OpKind {
    fn code(self) -> u64 {
        match self {
            OpKind::Insert => 1,
            OpKind::Remove => 2,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(OpKind::Insert),
            2 => Some(OpKind::Remove),
            _ => None,
        }
    }
}

/// Address of a record: lane and logical position within the lane
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogId(u64);

const POS_BITS: u32 = 56;
const POS_MASK: u64 = (1 << POS_BITS) - 1;

impl LogId {
    pub fn new(lane: usize, pos: u64) -> Self {
        debug_assert!(lane < 256 && pos <= POS_MASK);
        Self((lane as u64) << POS_BITS | pos)
    }

    pub fn lane(self) -> usize {
        (self.0 >> POS_BITS) as usize
    }

    pub fn pos(self) -> u64 {
        self.0 & POS_MASK
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({}:{})", self.lane(), self.pos())
    }
}

/// A decoded operation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Key,
    pub value: Value,
    pub stamp: u64,
    pub kind: OpKind,
    pub flip: bool,
}

impl LogRecord {
    pub fn to_words(&self) -> [u64; RECORD_WORDS] {
        let mut words = [0u64; RECORD_WORDS];
        words[..ENTRY_WORDS].copy_from_slice(&Entry::new(self.key, self.value).to_words());
        words[ENTRY_WORDS] = self.stamp;
        words[ENTRY_WORDS + 1] = TAG_MARKER | self.kind.code() << KIND_SHIFT | self.flip as u64;
        words
    }

    /// `None` for slots that never held a record
    pub fn from_words(words: &[u64]) -> Option<Self> {
        let tag = words[ENTRY_WORDS + 1];
        if tag & TAG_MARKER_MASK != TAG_MARKER {
            return None;
        }
        let kind = OpKind::from_code((tag & KIND_MASK) >> KIND_SHIFT)?;
        let entry = Entry::from_words(&words[..ENTRY_WORDS]);
        Some(Self {
            key: entry.key,
            value: entry.value,
            stamp: words[ENTRY_WORDS],
            kind,
            flip: tag & 1 == 1,
        })
    }

    pub fn is_remove(&self) -> bool {
        self.kind == OpKind::Remove
    }
}
