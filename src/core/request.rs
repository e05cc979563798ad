//! Request state: a group of sibling sequences sharing one prompt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SamplingParams;
use crate::core::sequence::Sequence;

/// Internal dense request identifier.
pub type RequestKey = u64;

/// Scheduling priority of a request.
///
/// Order matters: `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// One level up, saturating at `High`. Used by the starvation guard.
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal | Self::High => Self::High,
        }
    }

    /// Dense index for per-level queues: `High = 0`.
    pub fn level(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Admitted, not yet prefilled.
    Pending,
    /// At least one sequence is running.
    Running,
    /// Evicted under block pressure.
    Preempted,
    /// Every sequence carries a finish reason.
    Finished,
    /// Cancelled by the caller or by back-pressure.
    Cancelled,
}

/// A group of sibling sequences decoding one prompt.
///
/// Owns `best_of` sequences; on completion the top `n` by length-normalized
/// cumulative log-probability are delivered.
#[derive(Debug)]
pub struct Request {
    /// Internal key used by the scheduler's maps and pools.
    key: RequestKey,
    /// Caller-visible identifier.
    id: String,
    /// Current priority; aging may raise it above the admitted level.
    priority: Priority,
    arrival_time: Instant,
    stream: bool,
    sampling: Arc<SamplingParams>,
    sequences: Vec<Sequence>,
    status: RequestStatus,
    /// Set by [`RequestHandle`](crate::engine::output::RequestHandle) or by
    /// back-pressure; observed at step boundaries.
    cancelled: Arc<AtomicBool>,
    /// Whether each sequence's announcement delta went out (streaming).
    announced: Vec<bool>,
    /// Set once the primary's prefill completed and siblings were forked.
    forked: bool,
}

impl Request {
    pub fn new(
        key: RequestKey,
        id: String,
        priority: Priority,
        stream: bool,
        sampling: Arc<SamplingParams>,
        sequences: Vec<Sequence>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let announced = vec![false; sequences.len()];
        Self {
            key,
            id,
            priority,
            arrival_time: Instant::now(),
            stream,
            sampling,
            sequences,
            status: RequestStatus::Pending,
            cancelled,
            announced,
            forked: false,
        }
    }

    pub fn key(&self) -> RequestKey {
        self.key
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    pub fn sampling(&self) -> &Arc<SamplingParams> {
        &self.sampling
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    pub fn sequence(&self, index: usize) -> &Sequence {
        &self.sequences[index]
    }

    pub fn sequence_mut(&mut self, index: usize) -> &mut Sequence {
        &mut self.sequences[index]
    }

    /// The prefill lane; siblings fork from it once its prompt is cached.
    pub fn primary(&self) -> &Sequence {
        &self.sequences[0]
    }

    pub fn prompt_len(&self) -> usize {
        self.sequences[0].prompt_len()
    }

    pub fn cancel_flag(&self) -> &Arc<AtomicBool> {
        &self.cancelled
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    pub fn set_forked(&mut self) {
        self.forked = true;
    }

    /// Undo fork bookkeeping after a recompute preemption; the surviving
    /// siblings will be re-forked from the next prefill.
    pub fn reset_fork(&mut self) {
        self.forked = false;
    }

    /// A request is finished iff every sequence carries a finish reason.
    pub fn all_sequences_finished(&self) -> bool {
        self.sequences.iter().all(Sequence::is_finished)
    }

    /// First streaming delta for a sequence announces it with empty text.
    /// Returns whether the announcement still needs to be sent.
    pub fn take_announcement(&mut self, index: usize) -> bool {
        if self.announced[index] {
            false
        } else {
            self.announced[index] = true;
            true
        }
    }

    /// Indices of the `n` delivered sequences, index-ordered.
    ///
    /// With `best_of > n` the candidates are ranked by length-normalized
    /// cumulative log-probability and the rest are discarded.
    pub fn chosen_indices(&self) -> Vec<usize> {
        let n = self.sampling.n;
        if self.sequences.len() <= n {
            return (0..self.sequences.len()).collect();
        }
        let mut ranked: Vec<usize> = (0..self.sequences.len()).collect();
        ranked.sort_by(|&a, &b| {
            self.sequences[b]
                .normalized_logprob()
                .partial_cmp(&self.sequences[a].normalized_logprob())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(n);
        ranked.sort_unstable();
        ranked
    }

    /// Token accounting over the delivered sequences.
    pub fn usage(&self, chosen: &[usize]) -> (usize, usize) {
        let prompt_tokens = self.prompt_len();
        let completion_tokens = chosen
            .iter()
            .map(|&i| self.sequences[i].output_len())
            .sum();
        (prompt_tokens, completion_tokens)
    }
}
