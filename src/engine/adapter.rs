//! Engine adapter: the seam between the scheduler and the model.
//!
//! The model is opaque. The core assumes transformer-style per-token logits
//! and nothing else; kernels, tensor-parallel math, and weight loading live
//! behind [`ModelExecutor`].

use candle_core::Tensor;

use crate::error::EngineError;
use crate::scheduler::batch::BatchPlan;

/// Static facts the core needs about the loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Vocabulary size; width of the logits matrix.
    pub vocab_size: usize,
    /// Maximum total sequence length the model supports.
    pub max_context_len: usize,
    /// End-of-sequence token id.
    pub eos_token_id: u32,
}

/// Executes batch plans against the model.
///
/// `execute` is synchronous from the scheduler's perspective: it may launch
/// asynchronous device work internally but must return only when the logits
/// are host-visible. Block copy and swap directives carried by the plan are
/// applied before the forward pass.
///
/// An empty plan (swap directives only) must be accepted; the returned
/// logits then have zero rows.
pub trait ModelExecutor: Send {
    /// Static model facts, available before any forward pass.
    fn info(&self) -> ModelInfo;

    /// Total device bytes available for the KV cache. Sizes the block pool
    /// when the configuration does not pin it.
    fn kv_cache_capacity_bytes(&self) -> u64;

    /// KV bytes consumed by one block of `block_size` tokens.
    fn kv_block_bytes(&self, block_size: usize) -> u64;

    /// One-time warm-up before serving begins.
    fn warm_up(&mut self, max_tokens: usize) -> std::result::Result<(), EngineError>;

    /// Run one step; returns logits `[plan.num_sequences(), vocab_size]`,
    /// one row per scheduled sequence in plan order.
    fn execute(&mut self, plan: &BatchPlan) -> std::result::Result<Tensor, EngineError>;
}

/// Device blocks that fit in the executor's reported KV capacity.
pub fn derive_num_blocks(executor: &dyn ModelExecutor, block_size: usize) -> usize {
    let block_bytes = executor.kv_block_bytes(block_size).max(1);
    (executor.kv_cache_capacity_bytes() / block_bytes) as usize
}
