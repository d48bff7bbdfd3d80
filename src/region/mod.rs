//! Durable regions
//!
//! A durable region is a file mapped shared into the address space and viewed
//! as an array of `AtomicU64`. All durable state (descriptor, log rings, leaf
//! modules) is written through word-sized atomic stores, and made durable by
//! a persist barrier: write back the touched range, then fence.

mod descriptor;

pub use descriptor::{Descriptor, LayoutHeader};

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

use crate::config::Durability;
use crate::error::{Result, TierError};

pub const WORD_BYTES: usize = 8;

pub struct DurableRegion {
    map: MmapRaw,
    path: PathBuf,
    words: usize,
    durability: Durability,
}

// SAFETY: the mapping is only accessed through atomics.
unsafe impl Send for DurableRegion {}
unsafe impl Sync for DurableRegion {}

impl DurableRegion {
    /// Map `words` words at `path`, creating a zero-filled file if needed.
    /// Returns the region and whether it was freshly created.
    pub fn open(path: &Path, words: usize, durability: Durability) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = (words * WORD_BYTES) as u64;
        let existing = file.metadata()?.len();
        let created = existing == 0;
        if !created && existing != len {
            return Err(TierError::LayoutMismatch(format!(
                "{} is {} bytes, expected {}",
                path.display(),
                existing,
                len
            )));
        }
        if created {
            file.set_len(len)?;
        }

        let map = MmapOptions::new().len(len as usize).map_raw(&file)?;
        debug!(path = %path.display(), words, created, "mapped durable region");

        Ok((
            Self {
                map,
                path: path.to_path_buf(),
                words,
                durability,
            },
            created,
        ))
    }

    #[inline]
    pub fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is page aligned, `words * 8` bytes long and
        // lives as long as `self`; AtomicU64 tolerates concurrent access.
        unsafe { slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.words) }
    }

    #[inline]
    pub fn word(&self, idx: usize) -> &AtomicU64 {
        &self.words()[idx]
    }

    pub fn len_words(&self) -> usize {
        self.words
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write back `[off, off + len)` (in words) without fencing
    #[inline]
    pub fn writeback(&self, off: usize, len: usize) -> Result<()> {
        if self.durability == Durability::Msync && len > 0 {
            self.map.flush_range(off * WORD_BYTES, len * WORD_BYTES)?;
        }
        Ok(())
    }

    /// Store fence ordering earlier write-backs before later stores
    #[inline]
    pub fn fence() {
        fence(Ordering::SeqCst);
    }

    /// Durability barrier over `[off, off + len)`
    #[inline]
    pub fn persist(&self, off: usize, len: usize) -> Result<()> {
        self.writeback(off, len)?;
        Self::fence();
        Ok(())
    }

    /// Copy `src` into the region starting at word `off`. Not persisted.
    #[inline]
    pub fn bulk_copy(&self, off: usize, src: &[u64]) {
        let dst = &self.words()[off..off + src.len()];
        for (d, &s) in dst.iter().zip(src) {
            d.store(s, Ordering::Relaxed);
        }
    }

    /// Load `dst.len()` words starting at `off`
    #[inline]
    pub fn read_into(&self, off: usize, dst: &mut [u64]) {
        let src = &self.words()[off..off + dst.len()];
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s.load(Ordering::Relaxed);
        }
    }
}
