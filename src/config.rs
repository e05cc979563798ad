//! Configuration types for inference-core.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Prefill skips after which a starved waiting request is promoted one
/// priority level.
pub const DEFAULT_PREFILL_SKIP_LIMIT: u32 = 8;

/// How a running request is evicted when the block pool runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Drop blocks and generated tokens; re-prefill from the prompt later.
    #[default]
    Recompute,
    /// Copy block contents to host memory; swap back when capacity returns.
    Swap,
}

/// Engine configuration, fixed at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tokens per KV-cache block.
    pub block_size: usize,
    /// Device block pool size. `0` derives the pool from the executor's
    /// reported KV-cache capacity.
    pub num_blocks: usize,
    /// Host block pool size, used by swap preemption.
    pub num_host_blocks: usize,
    /// Maximum tokens (prefill + decode) in one batch.
    pub max_batch_tokens: usize,
    /// Maximum sequences in one batch.
    pub max_seqs_per_batch: usize,
    /// Eviction strategy under block pressure.
    pub preemption_mode: PreemptionMode,
    /// Waiting age after which a request is promoted one priority level.
    pub aging_threshold_ms: u64,
    /// Prefill skips after which a waiting request is promoted one level.
    pub prefill_skip_limit: u32,
    /// Capacity of the bounded admission channel.
    pub admission_queue_capacity: usize,
    /// Capacity of each per-request output queue.
    pub output_queue_capacity: usize,
    /// How long a request may stay back-pressured before it is cancelled.
    pub backpressure_grace_ms: u64,
    /// Budget for one scheduler step, including the admission poll.
    pub step_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: 0,
            num_host_blocks: 0,
            max_batch_tokens: 4096,
            max_seqs_per_batch: 256,
            preemption_mode: PreemptionMode::Recompute,
            aging_threshold_ms: 10_000,
            prefill_skip_limit: DEFAULT_PREFILL_SKIP_LIMIT,
            admission_queue_capacity: 1024,
            output_queue_capacity: 256,
            backpressure_grace_ms: 500,
            step_timeout_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that `Default` upholds but deserialization may not.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::config("block_size must be positive"));
        }
        if self.max_batch_tokens == 0 {
            return Err(Error::config("max_batch_tokens must be positive"));
        }
        if self.max_seqs_per_batch == 0 {
            return Err(Error::config("max_seqs_per_batch must be positive"));
        }
        if self.admission_queue_capacity == 0 {
            return Err(Error::config("admission_queue_capacity must be positive"));
        }
        if self.output_queue_capacity == 0 {
            return Err(Error::config("output_queue_capacity must be positive"));
        }
        if self.preemption_mode == PreemptionMode::Swap && self.num_host_blocks == 0 {
            return Err(Error::config(
                "swap preemption requires a non-empty host block pool",
            ));
        }
        Ok(())
    }

    /// Waiting age after which a request is promoted one priority level.
    pub fn aging_threshold(&self) -> Duration {
        Duration::from_millis(self.aging_threshold_ms)
    }

    /// Back-pressure grace before a stalled request is cancelled.
    pub fn backpressure_grace(&self) -> Duration {
        Duration::from_millis(self.backpressure_grace_ms)
    }

    /// Budget for one scheduler step.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Per-request sampling parameters.
///
/// Carried unchanged from admission to the sampling pipeline. Validated once
/// at admission; the hot path assumes the ranges below hold.
///
/// # Example
///
/// ```
/// use inference_core::SamplingParams;
///
/// let params = SamplingParams::greedy()
///     .with_max_tokens(64)
///     .with_stop(["\n\n"]);
/// assert!(params.validate().is_ok());
/// assert_eq!(params.temperature, 0.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature; `0` selects greedy decoding.
    pub temperature: f32,
    /// Nucleus sampling mass, in `(0, 1]`.
    pub top_p: f32,
    /// Top-k cutoff; `0` disables.
    pub top_k: usize,
    /// Subtracted per occurrence in history, in `[0, 2]`.
    pub frequency_penalty: f32,
    /// Subtracted once for tokens present in history, in `[-2, 2]`.
    pub presence_penalty: f32,
    /// Divides positive logits of repeated tokens; `1` disables.
    pub repetition_penalty: f32,
    /// Maximum generated tokens per sequence.
    pub max_tokens: usize,
    /// Stop strings; matched against decoded output, excluded from delivery.
    pub stop: Vec<String>,
    /// Token ids that stop generation when sampled.
    pub stop_token_ids: Vec<u32>,
    /// Strip special tokens when decoding output text.
    pub skip_special_tokens: bool,
    /// Disable the EOS-token stop (string stops and `max_tokens` still apply).
    pub ignore_eos: bool,
    /// Number of choices to return.
    pub n: usize,
    /// Candidates to generate before choosing `n`; defaults to `n`.
    pub best_of: Option<usize>,
    /// RNG seed for reproducible sampling.
    pub seed: Option<u64>,
    /// Additive per-token logit bias; `-inf` masks a token outright.
    pub logit_bias: Option<HashMap<u32, f32>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
            max_tokens: 256,
            stop: Vec::new(),
            stop_token_ids: Vec::new(),
            skip_special_tokens: true,
            ignore_eos: false,
            n: 1,
            best_of: None,
            seed: None,
            logit_bias: None,
        }
    }
}

impl SamplingParams {
    /// Parameters for deterministic greedy decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Set the maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set stop strings.
    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    /// Set the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the number of choices.
    pub fn with_n(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Set the candidate pool size.
    pub fn with_best_of(mut self, best_of: usize) -> Self {
        self.best_of = Some(best_of);
        self
    }

    /// Effective candidate pool size (`best_of`, defaulting to `n`).
    pub fn effective_best_of(&self) -> usize {
        self.best_of.unwrap_or(self.n)
    }

    /// Length in bytes of the longest stop string.
    pub fn longest_stop_len(&self) -> usize {
        self.stop.iter().map(String::len).max().unwrap_or(0)
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 {
            return Err(Error::invalid_request("temperature must be >= 0"));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::invalid_request("top_p must be in (0, 1]"));
        }
        if !(0.0..=2.0).contains(&self.frequency_penalty) {
            return Err(Error::invalid_request("frequency_penalty must be in [0, 2]"));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(Error::invalid_request("presence_penalty must be in [-2, 2]"));
        }
        if self.repetition_penalty < 0.0 {
            return Err(Error::invalid_request("repetition_penalty must be >= 0"));
        }
        if self.max_tokens == 0 {
            return Err(Error::invalid_request("max_tokens must be positive"));
        }
        if self.n == 0 {
            return Err(Error::invalid_request("n must be positive"));
        }
        if self.effective_best_of() < self.n {
            return Err(Error::invalid_request("best_of must be >= n"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_swap_requires_host_blocks() {
        let config = EngineConfig {
            preemption_mode: PreemptionMode::Swap,
            num_host_blocks: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sampling_params_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams::greedy().validate().is_ok());

        let bad_temp = SamplingParams {
            temperature: -0.5,
            ..SamplingParams::default()
        };
        assert!(bad_temp.validate().is_err());

        let bad_top_p = SamplingParams {
            top_p: 0.0,
            ..SamplingParams::default()
        };
        assert!(bad_top_p.validate().is_err());

        let bad_best_of = SamplingParams {
            n: 3,
            best_of: Some(2),
            ..SamplingParams::default()
        };
        assert!(bad_best_of.validate().is_err());

        let bad_max_tokens = SamplingParams {
            max_tokens: 0,
            ..SamplingParams::default()
        };
        assert!(bad_max_tokens.validate().is_err());
    }

    #[test]
    fn test_effective_best_of() {
        let params = SamplingParams::default().with_n(2);
        assert_eq!(params.effective_best_of(), 2);
        let params = params.with_best_of(5);
        assert_eq!(params.effective_best_of(), 5);
    }
}
