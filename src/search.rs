//! Fingerprint search
//!
//! Inodes (16 lanes) and leaves (40 lanes) keep one fingerprint byte per
//! slot. A lookup compares the probe fingerprint against all lanes at once and
//! gets back a bitmask of candidates, which the caller folds with its
//! validity bitmap before doing full key compares.
//!
//! - **`x86_64`**: SSE2, 16 lanes per compare (always available)
//! - **Other**: scalar fallback

// ============================================================================
//  Public Entry Point
// ============================================================================

/// Bitmask with bit `i` set when `fps[i] == fp`. At most 64 lanes.
#[inline]
#[must_use]
pub fn match_fingerprints(fps: &[u8], fp: u8) -> u64 {
    debug_assert!(fps.len() <= 64);

    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: SSE2 is part of the x86_64 baseline
        unsafe { sse2_impl::match_fingerprints_sse2(fps, fp) }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        match_fingerprints_scalar(fps, fp)
    }
}

/// Unpack fingerprint bytes from little-endian words
#[inline]
pub fn unpack_fingerprints(words: &[u64], out: &mut [u8]) {
    for (i, b) in out.iter_mut().enumerate() {
        *b = (words[i / 8] >> ((i % 8) * 8)) as u8;
    }
}

/// Replace lane `i` in a packed fingerprint word array
#[inline]
pub fn set_fingerprint(word: u64, lane: usize, fp: u8) -> u64 {
    let shift = (lane % 8) * 8;
    (word & !(0xFFu64 << shift)) | ((fp as u64) << shift)
}

// ============================================================================
//  Scalar Fallback
// ============================================================================

#[inline]
#[allow(dead_code)] // Used on non-x86 and in tests
#[must_use]
pub fn match_fingerprints_scalar(fps: &[u8], fp: u8) -> u64 {
    let mut mask = 0u64;
    for (i, &b) in fps.iter().enumerate() {
        if b == fp {
            mask |= 1 << i;
        }
    }
    mask
}

// ============================================================================
//  SSE2 Implementation
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod sse2_impl {
    use std::arch::x86_64::{_mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8};

    /// # Safety
    /// Caller must be on x86_64 (SSE2 is always available there).
    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    pub unsafe fn match_fingerprints_sse2(fps: &[u8], fp: u8) -> u64 {
        let len = fps.len();
        let mut mask = 0u64;
        let mut i = 0;

        unsafe {
            let probe = _mm_set1_epi8(fp as i8);
            while i + 16 <= len {
                let lanes = _mm_loadu_si128(fps.as_ptr().add(i).cast());
                let eq = _mm_movemask_epi8(_mm_cmpeq_epi8(lanes, probe)) as u32 as u64;
                mask |= (eq & 0xFFFF) << i;
                i += 16;
            }
        }

        while i < len {
            if fps[i] == fp {
                mask |= 1 << i;
            }
            i += 1;
        }
        mask
    }
}
