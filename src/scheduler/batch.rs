//! Batch plan assembly.
//!
//! A [`BatchPlan`] is the dense, device-ready description of one model step:
//! which tokens run, where their KV entries land, and which block moves the
//! engine must perform first. Tensor-shaped fields are plain vectors; the
//! engine adapter owns device placement.

use crate::core::request::RequestKey;
use crate::core::sequence::{Sequence, SequenceId};

/// One scheduled sequence's slice of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpan {
    pub seq_id: SequenceId,
    pub request_key: RequestKey,
    /// Rank inside its request; per-step delta ordering key.
    pub index: usize,
    /// Prefill span (whole prompt) or decode span (one token).
    pub is_prefill: bool,
    /// Tokens this sequence contributes to the step.
    pub num_tokens: usize,
}

/// Dense input description for one model step.
///
/// Invariants: prefill spans precede decode spans; every referenced block id
/// is reserved by a selected sequence; `token_ids.len() == positions.len()
/// == slot_ids.len() == cu_seq_lens.last()`.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Input token ids, sequences back to back.
    pub token_ids: Vec<u32>,
    /// Position of each input token within its sequence.
    pub positions: Vec<usize>,
    /// Cumulative span lengths, `[batch + 1]`.
    pub cu_seq_lens: Vec<usize>,
    /// Global KV slot written by each input token.
    pub slot_ids: Vec<usize>,
    /// Per-decode-sequence block tables, zero-padded to `max_blocks_per_seq`.
    pub block_tables: Vec<Vec<usize>>,
    /// Width of the padded block-table rows.
    pub max_blocks_per_seq: usize,
    /// Flat index of each sequence's final token; the rows of the logits
    /// matrix are sampled from these.
    pub last_token_indices: Vec<usize>,
    /// Scheduled sequences, prefills first.
    pub sequences: Vec<SequenceSpan>,
    /// Copy-on-write block duplications to perform before the forward pass.
    pub copy_blocks: Vec<(usize, usize)>,
    /// Host-to-device block moves (resuming swapped requests).
    pub swap_in: Vec<(usize, usize)>,
    /// Device-to-host block moves (swap preemption).
    pub swap_out: Vec<(usize, usize)>,
}

impl BatchPlan {
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn num_prefills(&self) -> usize {
        self.sequences.iter().filter(|s| s.is_prefill).count()
    }

    pub fn num_decodes(&self) -> usize {
        self.sequences.len() - self.num_prefills()
    }
}

/// Accumulates selected sequences into a [`BatchPlan`].
#[derive(Debug)]
pub struct PlanBuilder {
    plan: BatchPlan,
    saw_decode: bool,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            plan: BatchPlan {
                cu_seq_lens: vec![0],
                ..BatchPlan::default()
            },
            saw_decode: false,
        }
    }

    /// Tokens accumulated so far; the scheduler tracks this against the step
    /// budget.
    pub fn num_tokens(&self) -> usize {
        self.plan.num_tokens()
    }

    pub fn num_sequences(&self) -> usize {
        self.plan.num_sequences()
    }

    /// Add a full-prompt prefill span.
    pub fn add_prefill(&mut self, seq: &Sequence, request_key: RequestKey) {
        debug_assert!(!self.saw_decode, "prefill spans must precede decode spans");
        let prompt_len = seq.prompt_len();
        let offset = self.plan.token_ids.len();

        self.plan
            .token_ids
            .extend_from_slice(&seq.token_ids()[..prompt_len]);
        self.plan.positions.extend(0..prompt_len);
        self.plan
            .slot_ids
            .extend(seq.block_table().slot_mapping(0..prompt_len));
        self.plan.cu_seq_lens.push(offset + prompt_len);
        self.plan.last_token_indices.push(offset + prompt_len - 1);
        self.plan.sequences.push(SequenceSpan {
            seq_id: seq.seq_id(),
            request_key,
            index: seq.index(),
            is_prefill: true,
            num_tokens: prompt_len,
        });
    }

    /// Add a one-token decode span for the sequence's latest token.
    pub fn add_decode(&mut self, seq: &Sequence, request_key: RequestKey) {
        self.saw_decode = true;
        let len = seq.total_len();
        debug_assert!(len > 0, "decode of empty sequence");
        let position = len - 1;
        let offset = self.plan.token_ids.len();

        self.plan.token_ids.push(seq.token_ids()[position]);
        self.plan.positions.push(position);
        self.plan
            .slot_ids
            .push(seq.block_table().slot_for(position).unwrap_or_default());
        self.plan.cu_seq_lens.push(offset + 1);
        self.plan.last_token_indices.push(offset);
        self.plan.block_tables.push(seq.block_table().block_ids().to_vec());
        self.plan.sequences.push(SequenceSpan {
            seq_id: seq.seq_id(),
            request_key,
            index: seq.index(),
            is_prefill: false,
            num_tokens: 1,
        });
    }

    pub fn add_copy(&mut self, directive: (usize, usize)) {
        self.plan.copy_blocks.push(directive);
    }

    pub fn add_swap_in(&mut self, directives: impl IntoIterator<Item = (usize, usize)>) {
        self.plan.swap_in.extend(directives);
    }

    pub fn add_swap_out(&mut self, directives: impl IntoIterator<Item = (usize, usize)>) {
        self.plan.swap_out.extend(directives);
    }

    /// Pad the decode block tables into a rectangle and hand over the plan.
    pub fn finish(mut self) -> BatchPlan {
        let max_blocks = self
            .plan
            .block_tables
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        for row in &mut self.plan.block_tables {
            row.resize(max_blocks, 0);
        }
        self.plan.max_blocks_per_seq = max_blocks;
        self.plan
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}
