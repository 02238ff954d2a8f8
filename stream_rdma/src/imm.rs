/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Immediate data carried by pushed writes.
//!
//! The 32-bit word identifies which preload entry a write filled:
//!
//! ```text
//!  31 | 30 ........... 20 | 19 ................ 0
//! slot|  request index    |     writer rank
//! ```

const RANK_BITS: u32 = 20;
const INDEX_BITS: u32 = 11;
const INDEX_SHIFT: u32 = RANK_BITS;
const SLOT_SHIFT: u32 = RANK_BITS + INDEX_BITS;

/// Entries a single writer rank may contribute to one locked pattern.
pub const MAX_REQUESTS_PER_RANK: usize = 1 << INDEX_BITS;
/// Writer ranks addressable by a push.
pub const MAX_WRITER_RANKS: usize = 1 << RANK_BITS;

/// Double-buffer slot used by `sequence`.
pub fn slot_for(sequence: i64) -> usize {
    (sequence & 1) as usize
}

/// Decoded immediate word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushTag {
    pub slot: usize,
    pub index: usize,
    pub writer_rank: usize,
}

impl PushTag {
    pub fn new(slot: usize, index: usize, writer_rank: usize) -> Self {
        Self {
            slot,
            index,
            writer_rank,
        }
    }

    /// Packs the tag, or `None` when a field does not fit its bit range.
    pub fn encode(&self) -> Option<u32> {
        if self.slot > 1 || self.index >= MAX_REQUESTS_PER_RANK || self.writer_rank >= MAX_WRITER_RANKS {
            return None;
        }
        Some(
            ((self.slot as u32) << SLOT_SHIFT)
                | ((self.index as u32) << INDEX_SHIFT)
                | self.writer_rank as u32,
        )
    }

    pub fn decode(data: u32) -> Self {
        Self {
            slot: (data >> SLOT_SHIFT) as usize,
            index: ((data >> INDEX_SHIFT) & ((1 << INDEX_BITS) - 1)) as usize,
            writer_rank: (data & ((1 << RANK_BITS) - 1)) as usize,
        }
    }
}
