//! The serving engine.
//!
//! This module contains:
//! - the [`ModelExecutor`](adapter::ModelExecutor) seam to the model
//! - the sampling pipeline
//! - output events, sinks, and request handles
//! - [`LlmEngine`](llm::LlmEngine), the public façade

pub mod adapter;
pub mod llm;
pub mod output;
pub mod sampler;

pub use adapter::{ModelExecutor, ModelInfo};
pub use llm::{GenerationRequest, LlmEngine, PromptInput};
pub use output::{ErrorCode, OutputEvent, OutputSink, RequestHandle, SequenceOutput, Usage};
pub use sampler::{SampledToken, Sampler};
