//! Physical placement of leaves
//!
//! A leaf is `LEAF_BLOCKS` blocks of 256 bytes: one meta block followed by
//! entry blocks of four entries each. The blocks of one leaf are striped over
//! the modules of its color. Block `i` of leaf `blk` lands in module
//! `perm[blk % PERM_TABLES][i % modules]`, so consecutive leaves start on
//! different modules and no single module absorbs every meta block.

use super::LeafId;

/// Words per 256-byte block
pub const BLOCK_WORDS: usize = 32;

/// Entry slots per leaf
pub const LEAF_FANOUT: usize = 40;

pub const ENTRIES_PER_BLOCK: usize = 4;

/// Meta block plus entry blocks
pub const LEAF_BLOCKS: usize = 1 + LEAF_FANOUT / ENTRIES_PER_BLOCK;

const PERM_TABLES: usize = 64;

// Meta block word offsets
pub const META_VALIDMAP: usize = 0;
pub const META_FGPRT: usize = 1;
pub const FGPRT_WORDS: usize = LEAF_FANOUT.div_ceil(8);
pub const META_NEXT: usize = META_FGPRT + FGPRT_WORDS;
pub const META_PREV: usize = META_NEXT + 1;
pub const META_LFENCE: usize = META_PREV + 1;
pub const META_RFENCE: usize = META_LFENCE + crate::key::FENCE_WORDS;
pub const META_USED_WORDS: usize = META_RFENCE + crate::key::FENCE_WORDS;

/// Striping of leaf blocks across durable modules
#[derive(Debug, Clone)]
pub struct LeafLayout {
    pub nodes: usize,
    pub modules: usize,
    pub capacity: usize,
    blocks_per_module: usize,
    /// `perms[color][table]` is a permutation of `0..modules`
    perms: Vec<Vec<Vec<u8>>>,
}

impl LeafLayout {
    pub fn new(nodes: usize, modules: usize, capacity: usize) -> Self {
        let perms = (0..nodes)
            .map(|color| {
                (0..PERM_TABLES)
                    .map(|t| permutation(modules, (color * PERM_TABLES + t) as u64))
                    .collect()
            })
            .collect();
        Self {
            nodes,
            modules,
            capacity,
            blocks_per_module: LEAF_BLOCKS.div_ceil(modules),
            perms,
        }
    }

    /// Words in one module file
    pub fn module_words(&self) -> usize {
        self.capacity * self.blocks_per_module * BLOCK_WORDS
    }

    /// Module file index (`color * modules + m`) and word offset of `block`
    #[inline]
    pub fn locate(&self, leaf: LeafId, block: usize) -> (usize, usize) {
        debug_assert!(block < LEAF_BLOCKS);
        let color = leaf.color();
        let blk = leaf.blk() as usize;
        let perm = &self.perms[color][blk % PERM_TABLES];
        let module = perm[block % self.modules] as usize;
        let local = block / self.modules;
        let off = (blk * self.blocks_per_module + local) * BLOCK_WORDS;
        (color * self.modules + module, off)
    }

    /// Block and word-within-block holding entry `slot`
    #[inline]
    pub fn entry_block(slot: usize) -> (usize, usize) {
        (
            1 + slot / ENTRIES_PER_BLOCK,
            (slot % ENTRIES_PER_BLOCK) * crate::key::ENTRY_WORDS,
        )
    }
}

/// Deterministic Fisher-Yates shuffle driven by splitmix64
fn permutation(n: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut next = || {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };
    let mut perm: Vec<u8> = (0..n as u8).collect();
    for i in (1..n).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        perm.swap(i, j);
    }
    perm
}
