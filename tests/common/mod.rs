//! Shared test doubles: a character-level tokenizer, deterministic stub
//! executors, and an event-collecting sink.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use inference_core::engine::adapter::{ModelExecutor, ModelInfo};
use inference_core::engine::output::{OutputEvent, OutputSink};
use inference_core::error::{EngineError, Result};
use inference_core::scheduler::batch::BatchPlan;
use inference_core::tokenizer::{DecodeStream, Tokenizer};

/// Opt-in log output for debugging test runs: `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Token ids below this are "special" (EOS lives at 0).
pub const SPECIAL_BASE: u32 = 8;
pub const EOS: u32 = 0;
pub const VOCAB: usize = 256;

/// One token per Unicode scalar; decoding is direct char mapping.
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.chars().map(|c| c as u32).collect())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        Ok(tokens
            .iter()
            .filter(|&&t| !(skip_special_tokens && t < SPECIAL_BASE))
            .filter_map(|&t| char::from_u32(t))
            .collect())
    }

    fn new_stream(&self, skip_special_tokens: bool) -> Box<dyn DecodeStream> {
        Box::new(CharStream {
            skip_special_tokens,
        })
    }
}

struct CharStream {
    skip_special_tokens: bool,
}

impl DecodeStream for CharStream {
    fn push(&mut self, token: u32) -> Result<Option<String>> {
        if self.skip_special_tokens && token < SPECIAL_BASE {
            return Ok(None);
        }
        Ok(char::from_u32(token).map(String::from))
    }
}

fn default_info() -> ModelInfo {
    ModelInfo {
        vocab_size: VOCAB,
        max_context_len: 2048,
        eos_token_id: EOS,
    }
}

fn peaked_row(target: u32) -> Vec<f32> {
    let mut row = vec![0.0f32; VOCAB];
    row[target as usize % VOCAB] = 8.0;
    row[(target as usize + 1) % VOCAB] = 4.0;
    row
}

fn last_input_tokens(plan: &BatchPlan) -> Vec<u32> {
    plan.last_token_indices
        .iter()
        .map(|&i| plan.token_ids[i])
        .collect()
}

fn logits_from_rows(rows: Vec<Vec<f32>>) -> std::result::Result<Tensor, EngineError> {
    let batch = rows.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Tensor::from_vec(flat, (batch, VOCAB), &Device::Cpu)
        .map_err(|e| EngineError::forward(e.to_string()))
}

/// Deterministic successor model: the next token is `last + 1 (mod VOCAB)`,
/// optionally failing the nth `execute` call.
pub struct EchoExecutor {
    info: ModelInfo,
    pub fail_on_call: Option<usize>,
    calls: usize,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self {
            info: default_info(),
            fail_on_call: None,
            calls: 0,
        }
    }

    pub fn with_max_context(mut self, max_context_len: usize) -> Self {
        self.info.max_context_len = max_context_len;
        self
    }

    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }
}

impl ModelExecutor for EchoExecutor {
    fn info(&self) -> ModelInfo {
        self.info
    }

    fn kv_cache_capacity_bytes(&self) -> u64 {
        1 << 20
    }

    fn kv_block_bytes(&self, block_size: usize) -> u64 {
        (block_size * 64) as u64
    }

    fn warm_up(&mut self, _max_tokens: usize) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    fn execute(&mut self, plan: &BatchPlan) -> std::result::Result<Tensor, EngineError> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            return Err(EngineError::forward("injected failure"));
        }
        let rows = last_input_tokens(plan)
            .into_iter()
            .map(|t| peaked_row(t.wrapping_add(1) % VOCAB as u32))
            .collect();
        logits_from_rows(rows)
    }
}

/// Position-scripted model for single-request tests: the token generated at
/// output position `i` is `script[i % script.len()]`, regardless of input.
pub struct ScriptedExecutor {
    info: ModelInfo,
    prompt_len: usize,
    script: Vec<u32>,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(prompt_len: usize, script: &str) -> Self {
        Self {
            info: default_info(),
            prompt_len,
            script: script.chars().map(|c| c as u32).collect(),
            delay: Duration::ZERO,
        }
    }

    /// Slow each step down, e.g. to leave time for a mid-flight cancel.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ModelExecutor for ScriptedExecutor {
    fn info(&self) -> ModelInfo {
        self.info
    }

    fn kv_cache_capacity_bytes(&self) -> u64 {
        1 << 20
    }

    fn kv_block_bytes(&self, block_size: usize) -> u64 {
        (block_size * 64) as u64
    }

    fn warm_up(&mut self, _max_tokens: usize) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    fn execute(&mut self, plan: &BatchPlan) -> std::result::Result<Tensor, EngineError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let rows = plan
            .last_token_indices
            .iter()
            .map(|&i| {
                let position = plan.positions[i];
                let output_index = (position + 1).saturating_sub(self.prompt_len);
                peaked_row(self.script[output_index % self.script.len()])
            })
            .collect();
        logits_from_rows(rows)
    }
}

/// Thread-safe sink that records every event it sees.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<OutputEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> impl OutputSink + 'static {
        let events = self.events.clone();
        move |event: OutputEvent| {
            events.lock().unwrap().push(event);
            true
        }
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Block until `pred` holds over the collected events.
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(&[OutputEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(&self.events.lock().unwrap()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// The terminal event, once delivered.
    pub fn terminal(&self) -> Option<OutputEvent> {
        self.events().into_iter().find(|e| e.is_terminal())
    }
}
