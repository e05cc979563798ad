//! Output events and the sink seam.
//!
//! The scheduler thread never talks to transports directly: it enqueues
//! [`OutputEvent`] values onto a per-request queue and a delivery thread
//! drains them into the caller's [`OutputSink`]. The sink's boolean return
//! is the only back-channel; `false` cancels the request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::core::sequence::FinishReason;

/// Why a request failed, as delivered through the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Rejected at admission.
    InvalidRequest,
    /// The engine adapter failed the batch.
    Engine,
    /// The core hit an unexpected invariant violation.
    Internal,
}

/// One delivered choice of a finished request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceOutput {
    /// Rank of the sequence inside its request.
    pub index: usize,
    /// Full visible text (stop-truncated, special tokens per request).
    pub text: String,
    pub finish_reason: Option<FinishReason>,
}

/// Token accounting for a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One event delivered to a request's sink. Exactly-once, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Streaming increment for one sequence. The first delta of a sequence
    /// announces it with empty text; a sequence's last delta carries its
    /// finish reason.
    Delta {
        index: usize,
        text: String,
        finish_reason: Option<FinishReason>,
    },
    /// Final event for every request, streaming included: the chosen
    /// outputs plus token accounting. Always the last event a sink sees for
    /// a successfully admitted request.
    Finished {
        outputs: Vec<SequenceOutput>,
        usage: Usage,
    },
    /// Terminal failure for the whole request.
    Error { code: ErrorCode, message: String },
}

impl OutputEvent {
    /// Whether no further events will follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Error { .. })
    }
}

/// Consumer-side callback for one request's events.
///
/// Invoked from the engine's delivery thread. Returning `false` signals
/// back-pressure-style rejection and cancels the request.
pub trait OutputSink: Send {
    fn deliver(&mut self, event: OutputEvent) -> bool;
}

impl<F> OutputSink for F
where
    F: FnMut(OutputEvent) -> bool + Send,
{
    fn deliver(&mut self, event: OutputEvent) -> bool {
        self(event)
    }
}

/// Weak, caller-held handle to a submitted request.
///
/// Carries only the external id and the cancel flag, never a reference into
/// scheduler state. Cancellation is observed at step boundaries.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: String,
    cancelled: Arc<AtomicBool>,
}

impl RequestHandle {
    pub(crate) fn new(id: String, cancelled: Arc<AtomicBool>) -> Self {
        Self { id, cancelled }
    }

    /// The request's external id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the scheduler to cancel; serviced within one step's latency.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
