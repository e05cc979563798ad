//! Block abstractions for the paged KV cache.
//!
//! The cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A sequence's attention state
//! lives in whichever blocks its [`BlockTable`] points at.

use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};

/// A fixed-size chunk of KV cache memory.
///
/// Blocks are the unit of allocation in the
/// [`BlockManager`](super::block_manager::BlockManager). Sharing between
/// sibling sequences is expressed through the reference count.
#[derive(Debug, Clone)]
pub struct Block {
    /// Dense identifier within its pool.
    block_id: usize,
    /// Number of sequences holding this block.
    ref_count: usize,
}

impl Block {
    /// Create a new block with a single owner.
    pub fn new(block_id: usize) -> Self {
        Self {
            block_id,
            ref_count: 1,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether another sequence shares this block.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    /// Increment reference count (when sharing with another sequence).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count.
    ///
    /// Returns the new reference count after decrementing.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use inference_core::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.slot_for(20), Some(12 * 16 + 4));
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Create a new block table with default block size.
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the logical block is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids.get(logical_block_idx).copied().ok_or_else(|| {
            Error::internal(format!(
                "logical block {logical_block_idx} out of bounds ({} allocated)",
                self.block_ids.len()
            ))
        })
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Replace the physical block at a logical index (copy-on-write).
    pub fn replace_block(&mut self, logical_block_idx: usize, block_id: usize) {
        self.block_ids[logical_block_idx] = block_id;
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this sequence.
    pub fn block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Global slot index for a token position, if its block is allocated.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`.
    pub fn slot_for(&self, position: usize) -> Option<usize> {
        let logical_block = position / self.block_size;
        let slot_in_block = position % self.block_size;
        self.block_ids
            .get(logical_block)
            .map(|&physical| physical * self.block_size + slot_in_block)
    }

    /// Global slot indices for a range of token positions.
    ///
    /// Used to tell the engine where to write K/V for each token of a
    /// prefill span or a decode step.
    pub fn slot_mapping(&self, positions: std::ops::Range<usize>) -> Vec<usize> {
        positions.filter_map(|pos| self.slot_for(pos)).collect()
    }

    /// Clear all blocks from the table.
    pub fn clear(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Number of blocks required to hold a sequence of `seq_len` tokens.
///
/// # Example
///
/// ```
/// use inference_core::core::block::blocks_needed;
///
/// assert_eq!(blocks_needed(35, 16), 3);
/// assert_eq!(blocks_needed(32, 16), 2);
/// assert_eq!(blocks_needed(0, 16), 0);
/// ```
pub fn blocks_needed(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
