//! Persisted descriptor
//!
//! ```text
//! word  0        magic "TIERKV01"
//! word  1        layout header length (bytes)
//! word  2        layout header crc32
//! words 3..19    layout header (bincode)
//! word  19       init flag
//! word  20       head leaf id
//! word  24       cursor commit sequence (committed bank = seq & 1)
//! words 25..     per-lane end cursors
//!   then         per-lane start cursors, bank 0
//!   then         per-lane start cursors, bank 1
//! ```
//!
//! Every mutation is followed by a persist barrier over the touched words.
//! Start cursors move together: a checkpoint fills the shadow bank, persists
//! it, and then bumps the commit sequence with one single-word persist.
//! Readers only ever see the committed bank.

use std::path::Path;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::{Config, Durability};
use crate::error::{Result, TierError};

use super::DurableRegion;

const MAGIC: u64 = u64::from_le_bytes(*b"TIERKV01");
const FORMAT_VERSION: u32 = 1;

const MAGIC_WORD: usize = 0;
const HEADER_LEN_WORD: usize = 1;
const HEADER_CRC_WORD: usize = 2;
const HEADER_WORD: usize = 3;
const HEADER_WORDS: usize = 16;
const INIT_WORD: usize = 19;
const HEAD_WORD: usize = 20;
const COMMIT_WORD: usize = 24;
const CURSOR_WORD: usize = 25;

/// Geometry that must not change across reopen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutHeader {
    pub version: u32,
    pub lanes: u32,
    pub log_capacity: u64,
    pub leaf_capacity: u64,
    pub numa_nodes: u32,
    pub modules_per_node: u32,
}

impl LayoutHeader {
    pub fn from_config(config: &Config) -> Self {
        Self {
            version: FORMAT_VERSION,
            lanes: config.max_threads as u32,
            log_capacity: config.log_capacity as u64,
            leaf_capacity: config.leaf_capacity as u64,
            numa_nodes: config.numa_nodes as u32,
            modules_per_node: config.modules_per_node as u32,
        }
    }
}

pub struct Descriptor {
    region: DurableRegion,
    lanes: usize,
}

impl Descriptor {
    const FILENAME: &'static str = "descriptor.tkv";

    pub fn open(dir: &Path, lanes: usize, durability: Durability) -> Result<Self> {
        let words = CURSOR_WORD + 3 * lanes;
        let (region, _) = DurableRegion::open(&dir.join(Self::FILENAME), words, durability)?;
        Ok(Self { region, lanes })
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    // =========================================================================
    // Layout Header
    // =========================================================================

    pub fn write_layout(&self, header: &LayoutHeader) -> Result<()> {
        let bytes = bincode::serialize(header)?;
        if bytes.len() > HEADER_WORDS * 8 {
            return Err(TierError::Config("layout header too large".to_string()));
        }
        let mut buf = [0u8; HEADER_WORDS * 8];
        buf[..bytes.len()].copy_from_slice(&bytes);

        let mut words = [0u64; HEADER_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            *w = u64::from_le_bytes(chunk);
        }

        self.region.bulk_copy(HEADER_WORD, &words);
        self.store(HEADER_LEN_WORD, bytes.len() as u64);
        self.store(HEADER_CRC_WORD, crc32fast::hash(&bytes) as u64);
        self.store(MAGIC_WORD, MAGIC);
        self.region.persist(0, HEADER_WORD + HEADER_WORDS)
    }

    pub fn read_layout(&self) -> Result<LayoutHeader> {
        if self.load(MAGIC_WORD) != MAGIC {
            return Err(TierError::Corruption("descriptor magic mismatch".to_string()));
        }
        let len = self.load(HEADER_LEN_WORD) as usize;
        if len > HEADER_WORDS * 8 {
            return Err(TierError::Corruption("descriptor header length".to_string()));
        }

        let mut words = [0u64; HEADER_WORDS];
        self.region.read_into(HEADER_WORD, &mut words);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).take(len).collect();

        if crc32fast::hash(&bytes) as u64 != self.load(HEADER_CRC_WORD) {
            return Err(TierError::Corruption("descriptor header checksum".to_string()));
        }
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Fail unless the persisted layout equals `expected`
    pub fn check_layout(&self, expected: &LayoutHeader) -> Result<()> {
        let found = self.read_layout()?;
        if &found != expected {
            return Err(TierError::LayoutMismatch(format!(
                "persisted {:?}, configured {:?}",
                found, expected
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Init Flag & Head
    // =========================================================================

    pub fn is_initialized(&self) -> bool {
        self.load(INIT_WORD) == 1
    }

    pub fn set_initialized(&self) -> Result<()> {
        self.store(INIT_WORD, 1);
        self.region.persist(INIT_WORD, 1)
    }

    pub fn head(&self) -> u32 {
        self.load(HEAD_WORD) as u32
    }

    /// Publish a new leftmost leaf
    pub fn set_head(&self, leaf: u32) -> Result<()> {
        self.store(HEAD_WORD, leaf as u64);
        self.region.persist(HEAD_WORD, 1)
    }

    // =========================================================================
    // Log Cursors
    // =========================================================================

    /// Committed `(start, end)` of `lane`
    pub fn cursor(&self, lane: usize) -> (u64, u64) {
        let bank = self.committed_bank();
        (self.load(self.start_word(bank, lane)), self.load(self.end_word(lane)))
    }

    pub fn set_end(&self, lane: usize, end: u64) -> Result<()> {
        let word = self.end_word(lane);
        self.store(word, end);
        self.region.persist(word, 1)
    }

    /// Number of start-cursor commits so far
    pub fn commit_seq(&self) -> u64 {
        self.load(COMMIT_WORD)
    }

    /// Fill the shadow bank with the committed starts overridden by
    /// `updates`, and persist it. Invisible until `commit_starts`.
    pub fn stage_starts(&self, updates: &[(usize, u64)]) -> Result<()> {
        let committed = self.committed_bank();
        let shadow = committed ^ 1;
        let mut starts: Vec<u64> = (0..self.lanes)
            .map(|lane| self.load(self.start_word(committed, lane)))
            .collect();
        for &(lane, start) in updates {
            starts[lane] = start;
        }
        let base = self.start_word(shadow, 0);
        self.region.bulk_copy(base, &starts);
        self.region.persist(base, self.lanes)
    }

    /// Publish the staged bank. This persist is the single durability
    /// point for consumed cursors. Returns the new sequence.
    pub fn commit_starts(&self) -> Result<u64> {
        let seq = self.commit_seq() + 1;
        self.store(COMMIT_WORD, seq);
        self.region.persist(COMMIT_WORD, 1)?;
        Ok(seq)
    }

    fn committed_bank(&self) -> usize {
        (self.commit_seq() & 1) as usize
    }

    fn end_word(&self, lane: usize) -> usize {
        CURSOR_WORD + lane
    }

    fn start_word(&self, bank: usize, lane: usize) -> usize {
        CURSOR_WORD + self.lanes * (1 + bank) + lane
    }

    #[inline]
    fn load(&self, word: usize) -> u64 {
        self.region.word(word).load(Ordering::Acquire)
    }

    #[inline]
    fn store(&self, word: usize, value: u64) {
        self.region.word(word).store(value, Ordering::Release);
    }
}
