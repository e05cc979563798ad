//! Sequence state for generation requests.
//!
//! A sequence is one decoding lane of a request: its tokens, its KV block
//! table, its sampling state, and the bookkeeping needed to stream text and
//! decide when it is done.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use crate::config::SamplingParams;
use crate::core::block::{blocks_needed, BlockTable};
use crate::core::stop::StopState;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Swapped out to host memory (preempted).
    Swapped,
    /// Finished generation.
    Finished,
}

impl SequenceStatus {
    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Swapped => "Swapped",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for sequence completion.
///
/// When several reasons would fire in the same step, the highest-precedence
/// one wins: `Cancelled` > `Error` > `Stop` > `Length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Cancelled by the caller or by back-pressure.
    Cancelled,
    /// The engine failed while this sequence was in flight.
    Error,
    /// A stop string, stop token, or EOS matched.
    Stop,
    /// `max_tokens` or the model context length was reached.
    Length,
}

impl FinishReason {
    fn precedence(self) -> u8 {
        match self {
            Self::Cancelled => 3,
            Self::Error => 2,
            Self::Stop => 1,
            Self::Length => 0,
        }
    }

    /// The stronger of two reasons firing in the same step.
    pub fn merge(current: Option<Self>, new: Self) -> Self {
        match current {
            Some(old) if old.precedence() >= new.precedence() => old,
            _ => new,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// One decoding lane of a request.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// 0-based rank inside its request.
    index: usize,
    /// Prompt tokens first, then generated tokens.
    tokens: Vec<u32>,
    /// Fixed after construction.
    num_prompt_tokens: usize,
    /// Logical-to-physical KV mapping.
    block_table: BlockTable,
    /// Sampling configuration shared by the request's siblings.
    sampling: Arc<SamplingParams>,
    /// Current status.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
    /// Sum of log-probabilities of the generated tokens.
    cumulative_logprob: f32,
    /// Rolling window for stop-string detection.
    stop: StopState,
    /// Whether the prompt's KV is materialized (own prefill or fork).
    prefilled: bool,
    /// Visible output text, stop-truncated.
    output_text: String,
    /// Bytes of `output_text` already delivered as stream deltas. Survives
    /// recompute so replayed text is not re-emitted.
    emitted_len: usize,
    /// Sampling RNG; reseedable so recompute replays the same draws.
    rng: StdRng,
    seed: u64,
}

impl Sequence {
    /// Create a new sequence over a prompt.
    ///
    /// Siblings of one request derive distinct RNG streams from the request
    /// seed and their index; without a seed the stream is random.
    pub fn new(
        seq_id: SequenceId,
        index: usize,
        prompt_tokens: Vec<u32>,
        sampling: Arc<SamplingParams>,
        block_size: usize,
    ) -> Self {
        let seed = match sampling.seed {
            Some(seed) => seed.wrapping_add(index as u64),
            None => rand::rngs::OsRng.next_u64(),
        };
        let stop = StopState::new(&sampling.stop);
        let num_prompt_tokens = prompt_tokens.len();
        Self {
            seq_id,
            index,
            tokens: prompt_tokens,
            num_prompt_tokens,
            block_table: BlockTable::new(block_size),
            sampling,
            status: SequenceStatus::Waiting,
            finish_reason: None,
            cumulative_logprob: 0.0,
            stop,
            prefilled: false,
            output_text: String::new(),
            emitted_len: 0,
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    // ========== Getters ==========

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.tokens
    }

    /// Generated tokens only.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.tokens[self.num_prompt_tokens..]
    }

    pub fn last_token_id(&self) -> Option<u32> {
        self.tokens.last().copied()
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn cumulative_logprob(&self) -> f32 {
        self.cumulative_logprob
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn stop_state_mut(&mut self) -> &mut StopState {
        &mut self.stop
    }

    /// Visible (stop-truncated) output text so far.
    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn output_len(&self) -> usize {
        self.tokens.len() - self.num_prompt_tokens
    }

    pub fn total_len(&self) -> usize {
        self.tokens.len()
    }

    /// Blocks the allocator must still provide before this sequence can take
    /// one more token: `ceil((len + 1) / block_size) - table_len`.
    pub fn num_blocks_needed(&self, block_size: usize) -> usize {
        blocks_needed(self.tokens.len() + 1, block_size).saturating_sub(self.block_table.num_blocks())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Whether the prompt KV is materialized (own prefill or a fork).
    pub fn is_prefill_complete(&self) -> bool {
        self.prefilled
    }

    /// Length-normalized cumulative log-probability, the `best_of` ranking
    /// metric.
    pub fn normalized_logprob(&self) -> f32 {
        let generated = self.output_len();
        if generated == 0 {
            f32::NEG_INFINITY
        } else {
            self.cumulative_logprob / generated as f32
        }
    }

    // ========== Token operations ==========

    /// Append a generated token with its log-probability.
    pub fn append_token(&mut self, token_id: u32, logprob: f32) {
        debug_assert!(!self.is_finished(), "append to finished sequence");
        self.tokens.push(token_id);
        self.cumulative_logprob += logprob;
    }

    /// Mark the prompt KV as materialized.
    pub fn mark_prefilled(&mut self) {
        self.prefilled = true;
    }

    /// Append newly visible text; returns the delta not yet delivered.
    ///
    /// Text replayed after a recompute stays below the delivery watermark
    /// and produces an empty delta.
    pub fn push_output_text(&mut self, text: &str) -> String {
        self.output_text.push_str(text);
        if self.output_text.len() <= self.emitted_len {
            return String::new();
        }
        let delta = self.output_text[self.emitted_len..].to_string();
        self.emitted_len = self.output_text.len();
        delta
    }

    /// Whether the newly sampled token terminates generation by token id.
    ///
    /// `ignore_eos` disables the EOS stop but not explicit stop token ids.
    pub fn is_stop_token(&self, token_id: u32, eos_token_id: u32) -> bool {
        if self.sampling.stop_token_ids.contains(&token_id) {
            return true;
        }
        !self.sampling.ignore_eos && token_id == eos_token_id
    }

    /// Whether the sequence has exhausted its token budget.
    pub fn hit_length_limit(&self, max_context_len: usize) -> bool {
        self.output_len() >= self.sampling.max_tokens || self.total_len() >= max_context_len
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns an error if the current state does not allow this transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting (recompute preemption).
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Transition to swapped (swap preemption).
    pub fn set_swapped(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Swapped;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Swapped",
            }),
        }
    }

    /// Mark the sequence as finished. A stronger reason set earlier in the
    /// same step is kept.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.finish_reason = Some(FinishReason::merge(self.finish_reason, reason));
        self.status = SequenceStatus::Finished;
    }

    /// Reset generation state for recompute preemption: generated tokens and
    /// decoded text are dropped, the RNG rewinds to its initial seed so the
    /// replay reproduces the same draws, and delivered deltas stay counted so
    /// nothing is re-emitted.
    pub fn reset_for_recompute(&mut self) {
        self.tokens.truncate(self.num_prompt_tokens);
        self.cumulative_logprob = 0.0;
        self.stop.reset();
        self.output_text.clear();
        self.prefilled = false;
        self.rng = StdRng::seed_from_u64(self.seed);
        self.status = SequenceStatus::Waiting;
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq_id.hash(state);
    }
}
