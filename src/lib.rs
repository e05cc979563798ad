//! inference-core: the scheduling core of an LLM serving system.
//!
//! This crate implements the hard center of continuous-batching inference:
//! - a paged KV-cache block allocator with copy-on-write prompt sharing
//! - per-request sequence state, stop handling, and `best_of` selection
//! - a sampling pipeline (penalties, temperature, top-k/top-p)
//! - the continuous-batching scheduler: admission, preemption, priorities
//! - a threaded engine façade with streaming output fan-out
//!
//! Model execution, tokenization, and transport stay behind traits; see
//! [`engine::adapter::ModelExecutor`] and [`tokenizer::Tokenizer`].

pub mod config;
pub mod error;
pub mod metrics;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod tokenizer;

pub use crate::config::{EngineConfig, PreemptionMode, SamplingParams};
pub use crate::core::request::Priority;
pub use crate::core::sequence::FinishReason;
pub use crate::engine::adapter::{ModelExecutor, ModelInfo};
pub use crate::engine::llm::{GenerationRequest, LlmEngine, PromptInput};
pub use crate::engine::output::{OutputEvent, OutputSink, RequestHandle};
pub use crate::error::{EngineError, EngineErrorKind, Error, Result};
pub use crate::metrics::MetricsSnapshot;
pub use crate::scheduler::{batch::BatchPlan, ScheduleOutcome, Scheduler};
