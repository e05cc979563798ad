//! Error types for inference-core.

use thiserror::Error;

/// Result type alias for inference-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of engine-adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The forward pass itself failed.
    Forward,
    /// The device ran out of memory.
    OutOfMemory,
    /// A device or driver level fault.
    Device,
    /// Moving KV-cache blocks (swap/copy) failed.
    Cache,
}

/// Error raised by a [`ModelExecutor`](crate::engine::adapter::ModelExecutor).
///
/// The scheduler translates an engine error into per-sequence `error` finish
/// reasons for every sequence in the failed batch and keeps serving.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("engine error ({kind:?}): {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn forward(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Forward, message)
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Cache, message)
    }
}

/// Main error type for inference-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    ///
    /// Never surfaced to callers; the scheduler recovers via preemption.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// The request was malformed and rejected at admission.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request was cancelled by its caller.
    #[error("request cancelled")]
    Cancelled,

    /// Sequence not found in scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Batch-wide failure reported by the engine adapter.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected invariant violation; terminates the scheduler thread.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error terminates the scheduler thread.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}
