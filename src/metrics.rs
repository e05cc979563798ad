//! Write-only engine counters.
//!
//! The scheduler thread only ever increments; readers snapshot through shared
//! references. Counters are plain atomics so the hot path never allocates or
//! locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the engine core.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Requests accepted into the waiting pool.
    pub requests_admitted: AtomicU64,
    /// Requests that reached a terminal state with all sequences finished.
    pub requests_finished: AtomicU64,
    /// Requests cancelled by their caller or by back-pressure.
    pub requests_cancelled: AtomicU64,
    /// Requests rejected at admission.
    pub requests_rejected: AtomicU64,
    /// Tokens produced by the sampling pipeline.
    pub tokens_generated: AtomicU64,
    /// Prompt tokens consumed by prefill passes.
    pub prompt_tokens: AtomicU64,
    /// Running requests evicted under block pressure.
    pub preemptions: AtomicU64,
    /// Requests moved to the host pool (swap preemption only).
    pub swap_outs: AtomicU64,
    /// Batch-wide engine failures.
    pub engine_errors: AtomicU64,
    /// Scheduler steps that executed a batch.
    pub steps: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_admitted: u64,
    pub requests_finished: u64,
    pub requests_cancelled: u64,
    pub requests_rejected: u64,
    pub tokens_generated: u64,
    pub prompt_tokens: u64,
    pub preemptions: u64,
    pub swap_outs: u64,
    pub engine_errors: u64,
    pub steps: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, delta: u64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_finished: self.requests_finished.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            tokens_generated: self.tokens_generated.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            steps: self.steps.load(Ordering::Relaxed),
        }
    }
}
