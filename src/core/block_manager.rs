//! Block manager for the paged KV cache.
//!
//! Owns the device block pool (and the host pool backing swap preemption),
//! hands blocks out to sequences and takes them back. Reference counting
//! lets sibling sequences share their prompt prefix copy-on-write.
//!
//! Access is serialized by the scheduler thread; the manager itself takes no
//! locks.

use std::collections::HashMap;

use tracing::debug;

use crate::core::block::{blocks_needed, Block, BlockTable};
use crate::error::{Error, Result};

/// One free-listed, ref-counted pool of blocks.
#[derive(Debug)]
struct Pool {
    /// Live (allocated) blocks indexed by block_id.
    blocks: HashMap<usize, Block>,
    /// Free block IDs. LIFO: recently freed ids are reused first.
    free_list: Vec<usize>,
    /// Total number of blocks.
    num_blocks: usize,
}

impl Pool {
    fn new(num_blocks: usize) -> Self {
        // Reversed so the first pops hand out low ids.
        let free_list: Vec<usize> = (0..num_blocks).rev().collect();
        Self {
            blocks: HashMap::with_capacity(num_blocks),
            free_list,
            num_blocks,
        }
    }

    fn num_free(&self) -> usize {
        self.free_list.len()
    }

    fn allocate(&mut self) -> Result<usize> {
        let block_id = self.free_list.pop().ok_or(Error::OutOfBlocks)?;
        self.blocks.insert(block_id, Block::new(block_id));
        Ok(block_id)
    }

    fn fork(&mut self, block_id: usize) -> Result<()> {
        self.blocks
            .get_mut(&block_id)
            .map(Block::increment_ref)
            .ok_or_else(|| Error::internal(format!("fork of unallocated block {block_id}")))
    }

    fn is_shared(&self, block_id: usize) -> bool {
        self.blocks.get(&block_id).is_some_and(Block::is_shared)
    }

    /// Drop one reference; returns `true` when the block went back on the
    /// free list.
    fn free(&mut self, block_id: usize) -> bool {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            if block.decrement_ref() == 0 {
                self.blocks.remove(&block_id);
                self.free_list.push(block_id);
                return true;
            }
        }
        false
    }

    fn ref_count(&self, block_id: usize) -> usize {
        self.blocks.get(&block_id).map_or(0, Block::ref_count)
    }

    fn reset(&mut self) {
        self.blocks.clear();
        self.free_list.clear();
        self.free_list.extend((0..self.num_blocks).rev());
    }
}

/// Result of reserving room for one more token in a sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendSlot {
    /// Copy directive `(src, dst)` issued when a shared tail block had to be
    /// duplicated before the next KV write.
    pub copied: Option<(usize, usize)>,
}

/// Manages allocation and deallocation of KV cache blocks.
#[derive(Debug)]
pub struct BlockManager {
    device: Pool,
    host: Pool,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockManager {
    /// Create a manager over `num_blocks` device blocks and `num_host_blocks`
    /// host blocks (the host pool may be empty when swap is unused).
    pub fn new(num_blocks: usize, num_host_blocks: usize, block_size: usize) -> Self {
        Self {
            device: Pool::new(num_blocks),
            host: Pool::new(num_host_blocks),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of device blocks.
    pub fn num_blocks(&self) -> usize {
        self.device.num_blocks
    }

    /// Number of free device blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.device.num_free()
    }

    /// Number of free host blocks.
    pub fn num_free_host_blocks(&self) -> usize {
        self.host.num_free()
    }

    /// Check if `count` device blocks can be allocated.
    pub fn can_allocate(&self, count: usize) -> bool {
        self.device.num_free() >= count
    }

    /// Reference count of a device block (0 if unallocated).
    pub fn ref_count(&self, block_id: usize) -> usize {
        self.device.ref_count(block_id)
    }

    /// Allocate a single device block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no free blocks are available.
    pub fn allocate(&mut self) -> Result<usize> {
        self.device.allocate()
    }

    /// Allocate `count` device blocks, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if fewer than `count` are free.
    pub fn allocate_many(&mut self, count: usize) -> Result<Vec<usize>> {
        if !self.can_allocate(count) {
            return Err(Error::OutOfBlocks);
        }
        (0..count).map(|_| self.device.allocate()).collect()
    }

    /// Share every block of `src_blocks` with another holder.
    ///
    /// Returns the same ids as a fresh handle list for the sibling's table.
    /// Used when a request spawns sibling sequences from a shared prompt
    /// prefix; divergence is handled copy-on-write by [`append_slot`].
    ///
    /// [`append_slot`]: BlockManager::append_slot
    pub fn fork(&mut self, src_blocks: &[usize]) -> Result<Vec<usize>> {
        for &block_id in src_blocks {
            self.device.fork(block_id)?;
        }
        Ok(src_blocks.to_vec())
    }

    /// Drop one reference to a device block.
    pub fn free(&mut self, block_id: usize) -> bool {
        self.device.free(block_id)
    }

    /// Drop one reference to each block. Idempotent on empty input.
    ///
    /// Returns how many blocks went back on the free list.
    pub fn free_many(&mut self, block_ids: &[usize]) -> usize {
        block_ids.iter().filter(|&&id| self.free(id)).count()
    }

    /// Release a whole table, clearing it.
    pub fn free_table(&mut self, table: &mut BlockTable) -> usize {
        let ids = table.clear();
        self.free_many(&ids)
    }

    /// Device blocks needed before a sequence of `seq_len` tokens can take
    /// one more: growth of the table plus a potential copy-on-write of the
    /// block receiving the next KV write.
    pub fn blocks_needed_for_append(&self, table: &BlockTable, seq_len: usize) -> usize {
        let mut needed = blocks_needed(seq_len + 1, self.block_size).saturating_sub(table.num_blocks());
        if seq_len > 0 {
            let write_block = (seq_len - 1) / self.block_size;
            if let Some(&id) = table.block_ids().get(write_block) {
                if self.device.is_shared(id) {
                    needed += 1;
                }
            }
        }
        needed
    }

    /// Reserve room for one more token of a sequence currently `seq_len`
    /// tokens long.
    ///
    /// Grows the table when the next token starts a new block, and duplicates
    /// the block about to receive this step's KV write if it is shared with a
    /// sibling. The caller must ensure capacity via
    /// [`blocks_needed_for_append`](Self::blocks_needed_for_append) first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the pool runs dry mid-reservation.
    pub fn append_slot(&mut self, table: &mut BlockTable, seq_len: usize) -> Result<AppendSlot> {
        let required = blocks_needed(seq_len + 1, self.block_size);
        while table.num_blocks() < required {
            let block_id = self.device.allocate()?;
            table.append_block(block_id);
        }

        let mut outcome = AppendSlot::default();
        if seq_len > 0 {
            // This step writes KV for the token at position seq_len - 1.
            let write_block = (seq_len - 1) / self.block_size;
            let src = table.get_block_id(write_block)?;
            if self.device.is_shared(src) {
                let dst = self.device.allocate()?;
                self.device.free(src);
                table.replace_block(write_block, dst);
                debug!(src, dst, "copy-on-write block split");
                outcome.copied = Some((src, dst));
            }
        }
        Ok(outcome)
    }

    /// Whether every unique block of `tables` fits in the host pool.
    pub fn can_swap_out(&self, tables: &[&BlockTable]) -> bool {
        self.unique_blocks(tables) <= self.host.num_free()
    }

    /// Whether every unique block of `tables` fits back in the device pool.
    pub fn can_swap_in(&self, tables: &[&BlockTable]) -> bool {
        self.unique_blocks(tables) <= self.device.num_free()
    }

    fn unique_blocks(&self, tables: &[&BlockTable]) -> usize {
        let mut seen = std::collections::HashSet::new();
        for table in tables {
            seen.extend(table.block_ids().iter().copied());
        }
        seen.len()
    }

    /// Drop one reference to each block of a host-resident table.
    pub fn free_host_table(&mut self, table: &mut BlockTable) -> usize {
        let ids = table.clear();
        ids.iter().filter(|&&id| self.host.free(id)).count()
    }

    /// Move a request's blocks to the host pool.
    ///
    /// Rewrites every table in place to host block ids and returns the
    /// `(device, host)` copy directives the engine must execute. Blocks
    /// shared between the tables are moved once.
    pub fn swap_out(&mut self, tables: &mut [BlockTable]) -> Result<Vec<(usize, usize)>> {
        Self::swap_between(&mut self.device, &mut self.host, tables)
    }

    /// Move a request's blocks back to the device pool.
    ///
    /// Returns `(host, device)` copy directives.
    pub fn swap_in(&mut self, tables: &mut [BlockTable]) -> Result<Vec<(usize, usize)>> {
        Self::swap_between(&mut self.host, &mut self.device, tables)
    }

    fn swap_between(
        from: &mut Pool,
        to: &mut Pool,
        tables: &mut [BlockTable],
    ) -> Result<Vec<(usize, usize)>> {
        let mut mapping: HashMap<usize, usize> = HashMap::new();
        let mut directives = Vec::new();
        for table in tables.iter_mut() {
            for logical in 0..table.num_blocks() {
                let src = table.get_block_id(logical)?;
                let dst = match mapping.get(&src) {
                    Some(&dst) => {
                        to.fork(dst)?;
                        dst
                    }
                    None => {
                        let dst = to.allocate()?;
                        mapping.insert(src, dst);
                        directives.push((src, dst));
                        dst
                    }
                };
                from.free(src);
                table.replace_block(logical, dst);
            }
        }
        Ok(directives)
    }

    /// Return every block to the free lists.
    pub fn reset(&mut self) {
        self.device.reset();
        self.host.reset();
    }
}
