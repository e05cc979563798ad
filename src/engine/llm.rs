//! The serving engine: admission, the scheduler thread, and output fan-out.
//!
//! One dedicated scheduler thread owns all mutable core state and runs the
//! step loop. Producers reach it only through a bounded admission channel
//! and per-request cancel flags; a delivery thread drains per-request output
//! queues into caller sinks so the scheduler never blocks on a slow
//! consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use candle_core::IndexOp;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, SamplingParams};
use crate::core::request::{Priority, RequestKey, RequestStatus};
use crate::core::sequence::{FinishReason, SequenceId};
use crate::engine::adapter::{derive_num_blocks, ModelExecutor};
use crate::engine::output::{
    ErrorCode, OutputEvent, OutputSink, RequestHandle, SequenceOutput, Usage,
};
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::scheduler::batch::BatchPlan;
use crate::scheduler::Scheduler;
use crate::tokenizer::{ChatTemplate, DecodeStream, Message, Tokenizer};

/// Prompt payload of a generation request.
#[derive(Debug, Clone)]
pub enum PromptInput {
    /// Raw text, tokenized as-is.
    Text(String),
    /// Chat messages, rendered through the configured template.
    Messages(Vec<Message>),
}

/// A request for text generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// External id; generated when absent.
    pub id: Option<String>,
    pub input: PromptInput,
    pub sampling: SamplingParams,
    pub priority: Priority,
    pub stream: bool,
}

impl GenerationRequest {
    /// Request over raw prompt text with default settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            input: PromptInput::Text(prompt.into()),
            sampling: SamplingParams::default(),
            priority: Priority::Normal,
            stream: false,
        }
    }

    /// Request over chat messages.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            id: None,
            input: PromptInput::Messages(messages),
            sampling: SamplingParams::default(),
            priority: Priority::Normal,
            stream: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Per-request event queue between the scheduler and the delivery thread.
///
/// The scheduler only pushes; capacity is a watermark, not a hard bound, so
/// ordering and exactly-once survive a slow sink while the back-pressure
/// grace runs out.
struct OutputQueue {
    events: Mutex<VecDeque<OutputEvent>>,
    sink: Mutex<Box<dyn OutputSink>>,
    capacity: usize,
    /// Sink returned `false`; discard further events.
    sink_closed: AtomicBool,
    /// The request's cancel flag; back-pressure and sink rejection set it.
    cancel: Arc<AtomicBool>,
}

impl OutputQueue {
    fn new(sink: Box<dyn OutputSink>, capacity: usize, cancel: Arc<AtomicBool>) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            sink: Mutex::new(sink),
            capacity,
            sink_closed: AtomicBool::new(false),
            cancel,
        }
    }

    fn push(&self, event: OutputEvent) {
        self.events.lock().push_back(event);
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Drain queued events into the sink, in order. Runs on the delivery
    /// thread only.
    fn drain(&self) {
        loop {
            let Some(event) = self.events.lock().pop_front() else {
                return;
            };
            if self.sink_closed.load(Ordering::Acquire) {
                continue; // discard; the request is on its way out
            }
            if !self.sink.lock().deliver(event) {
                self.sink_closed.store(true, Ordering::Release);
                self.cancel.store(true, Ordering::Release);
            }
        }
    }
}

/// Admission message from a producer thread to the scheduler thread.
struct AdmissionMsg {
    key: RequestKey,
    id: String,
    prompt_tokens: Vec<u32>,
    sampling: Arc<SamplingParams>,
    priority: Priority,
    stream: bool,
    cancel: Arc<AtomicBool>,
    queue: Arc<OutputQueue>,
}

/// Public engine handle.
///
/// Owns the scheduler and delivery threads; dropping it shuts both down
/// after the current step.
pub struct LlmEngine {
    admission_tx: Option<Sender<AdmissionMsg>>,
    notify_tx: Option<Sender<Arc<OutputQueue>>>,
    tokenizer: Arc<dyn Tokenizer>,
    chat_template: Option<Arc<dyn ChatTemplate>>,
    metrics: Arc<EngineMetrics>,
    shutdown: Arc<AtomicBool>,
    scheduler_thread: Option<JoinHandle<()>>,
    delivery_thread: Option<JoinHandle<()>>,
    next_request: AtomicU64,
    max_context_len: usize,
    output_queue_capacity: usize,
}

impl LlmEngine {
    /// Build the engine and start serving.
    ///
    /// Warm-up runs here; the block pool is sized from the configuration or,
    /// when unset, from the executor's reported KV capacity.
    pub fn new(
        config: EngineConfig,
        mut executor: Box<dyn ModelExecutor>,
        tokenizer: Arc<dyn Tokenizer>,
        chat_template: Option<Arc<dyn ChatTemplate>>,
    ) -> Result<Self> {
        config.validate()?;
        let info = executor.info();
        let num_blocks = if config.num_blocks > 0 {
            config.num_blocks
        } else {
            derive_num_blocks(executor.as_ref(), config.block_size)
        };
        if num_blocks == 0 {
            return Err(Error::config("no KV cache capacity for even one block"));
        }
        executor.warm_up(config.max_batch_tokens).map_err(Error::Engine)?;
        info!(
            num_blocks,
            block_size = config.block_size,
            max_batch_tokens = config.max_batch_tokens,
            "engine starting"
        );

        let metrics = Arc::new(EngineMetrics::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (admission_tx, admission_rx) = bounded(config.admission_queue_capacity);
        let (notify_tx, notify_rx) = unbounded::<Arc<OutputQueue>>();

        let scheduler = Scheduler::new(&config, num_blocks, info.max_context_len, metrics.clone());
        let core = EngineCore {
            scheduler,
            executor,
            sampler: Sampler::new(),
            tokenizer: tokenizer.clone(),
            admission_rx,
            notify_tx: notify_tx.clone(),
            queues: HashMap::new(),
            streams: HashMap::new(),
            backpressure: HashMap::new(),
            step_timeout: config.step_timeout(),
            backpressure_grace: config.backpressure_grace(),
            eos_token_id: info.eos_token_id,
            metrics: metrics.clone(),
        };

        let core_shutdown = shutdown.clone();
        let scheduler_thread = std::thread::Builder::new()
            .name("inference-scheduler".into())
            .spawn(move || core.run(&core_shutdown))?;
        let delivery_thread = std::thread::Builder::new()
            .name("inference-delivery".into())
            .spawn(move || {
                while let Ok(queue) = notify_rx.recv() {
                    queue.drain();
                }
            })?;

        Ok(Self {
            admission_tx: Some(admission_tx),
            notify_tx: Some(notify_tx),
            tokenizer,
            chat_template,
            metrics,
            shutdown,
            scheduler_thread: Some(scheduler_thread),
            delivery_thread: Some(delivery_thread),
            next_request: AtomicU64::new(1),
            max_context_len: info.max_context_len,
            output_queue_capacity: config.output_queue_capacity,
        })
    }

    /// Submit a request; events arrive through `sink` on the delivery
    /// thread.
    ///
    /// Never fails for request-shaped problems: a malformed request produces
    /// an immediate `Error` event on the sink and a handle that is already
    /// done. Blocks only when the admission queue is full.
    pub fn submit(
        &self,
        request: GenerationRequest,
        sink: impl OutputSink + 'static,
    ) -> RequestHandle {
        let key = self.next_request.fetch_add(1, Ordering::Relaxed);
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| format!("req-{key}"));
        let cancel = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(OutputQueue::new(
            Box::new(sink),
            self.output_queue_capacity,
            cancel.clone(),
        ));
        let handle = RequestHandle::new(id.clone(), cancel.clone());

        match self.prepare(&request) {
            Ok(prompt_tokens) => {
                let msg = AdmissionMsg {
                    key,
                    id,
                    prompt_tokens,
                    sampling: Arc::new(request.sampling),
                    priority: request.priority,
                    stream: request.stream,
                    cancel,
                    queue: queue.clone(),
                };
                let alive = self
                    .admission_tx
                    .as_ref()
                    .map(|tx| tx.send(msg).is_ok())
                    .unwrap_or(false);
                if !alive {
                    self.reject(&queue, ErrorCode::Internal, "engine is shut down");
                }
            }
            Err(err) => {
                EngineMetrics::incr(&self.metrics.requests_rejected);
                self.reject(&queue, ErrorCode::InvalidRequest, &err.to_string());
            }
        }
        handle
    }

    /// Validate and tokenize on the producer thread.
    fn prepare(&self, request: &GenerationRequest) -> Result<Vec<u32>> {
        request.sampling.validate()?;
        if request.stream && request.sampling.effective_best_of() > request.sampling.n {
            return Err(Error::invalid_request(
                "streaming is not supported with best_of > n",
            ));
        }
        let text = match &request.input {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Messages(messages) => match &self.chat_template {
                Some(template) => template.render(messages)?,
                None => {
                    return Err(Error::invalid_request(
                        "chat messages require a chat template",
                    ))
                }
            },
        };
        let tokens = self
            .tokenizer
            .encode(&text)
            .map_err(|e| Error::invalid_request(e.to_string()))?;
        if tokens.is_empty() {
            return Err(Error::invalid_request("empty prompt"));
        }
        if tokens.len() >= self.max_context_len {
            return Err(Error::invalid_request(format!(
                "prompt of {} tokens exceeds model context length {}",
                tokens.len(),
                self.max_context_len
            )));
        }
        Ok(tokens)
    }

    fn reject(&self, queue: &Arc<OutputQueue>, code: ErrorCode, message: &str) {
        queue.push(OutputEvent::Error {
            code,
            message: message.to_string(),
        });
        if let Some(tx) = &self.notify_tx {
            let _ = tx.send(queue.clone());
        }
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for LlmEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Disconnecting the channels unblocks both threads.
        self.admission_tx.take();
        if let Some(handle) = self.scheduler_thread.take() {
            let _ = handle.join();
        }
        self.notify_tx.take();
        if let Some(handle) = self.delivery_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the scheduler thread owns.
struct EngineCore {
    scheduler: Scheduler,
    executor: Box<dyn ModelExecutor>,
    sampler: Sampler,
    tokenizer: Arc<dyn Tokenizer>,
    admission_rx: Receiver<AdmissionMsg>,
    notify_tx: Sender<Arc<OutputQueue>>,
    queues: HashMap<RequestKey, Arc<OutputQueue>>,
    streams: HashMap<SequenceId, Box<dyn DecodeStream>>,
    /// When each request's output queue first exceeded its watermark.
    backpressure: HashMap<RequestKey, Instant>,
    step_timeout: Duration,
    backpressure_grace: Duration,
    eos_token_id: u32,
    metrics: Arc<EngineMetrics>,
}

/// Per-sequence result of one step, ready for fan-out.
struct StepEvent {
    key: RequestKey,
    index: usize,
    text: String,
    finish: Option<FinishReason>,
}

impl EngineCore {
    fn run(mut self, shutdown: &AtomicBool) {
        info!("scheduler thread started");
        while !shutdown.load(Ordering::Acquire) {
            if let Err(err) = self.step(self.step_timeout) {
                error!(%err, "fatal scheduler error; failing all requests");
                self.fail_all(&err);
                break;
            }
        }
        info!("scheduler thread stopped");
    }

    /// One scheduler step: service cancellations, drain admissions, build
    /// and execute a batch, sample, retire, fan out.
    fn step(&mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        self.enforce_backpressure();
        self.service_cancellations()?;
        self.drain_admissions(timeout / 2);

        let outcome = self.scheduler.schedule()?;
        let Some(plan) = outcome.plan else {
            // No runnable sequence; wait for admissions instead of spinning.
            let remaining = timeout.saturating_sub(started.elapsed());
            match self.admission_rx.recv_timeout(remaining) {
                Ok(msg) => self.admit(msg)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(remaining.min(Duration::from_millis(20)));
                }
            }
            return Ok(());
        };

        debug!(
            prefills = plan.num_prefills(),
            decodes = plan.num_decodes(),
            tokens = plan.num_tokens(),
            "executing batch"
        );
        let logits = match self.executor.execute(&plan) {
            Ok(logits) => logits,
            Err(engine_err) => {
                warn!(%engine_err, "engine failed the batch");
                EngineMetrics::incr(&self.metrics.engine_errors);
                self.fail_batch(&plan)?;
                return Ok(());
            }
        };
        if logits.dims().first().copied() != Some(plan.num_sequences()) {
            return Err(Error::internal(format!(
                "executor returned {:?} logits for a {}-sequence batch",
                logits.dims(),
                plan.num_sequences()
            )));
        }

        let events = self.process_batch(&plan, &logits)?;
        self.fan_out(events)?;
        Ok(())
    }

    fn admit(&mut self, msg: AdmissionMsg) -> Result<()> {
        let AdmissionMsg {
            key,
            id,
            prompt_tokens,
            sampling,
            priority,
            stream,
            cancel,
            queue,
        } = msg;
        match self.scheduler.admit(key, id, priority, stream, sampling, prompt_tokens, cancel) {
            Ok(()) => {
                self.queues.insert(key, queue);
                Ok(())
            }
            Err(Error::InvalidRequest(message)) => {
                EngineMetrics::incr(&self.metrics.requests_rejected);
                queue.push(OutputEvent::Error {
                    code: ErrorCode::InvalidRequest,
                    message,
                });
                let _ = self.notify_tx.send(queue);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn drain_admissions(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            match self.admission_rx.try_recv() {
                Ok(msg) => {
                    if let Err(err) = self.admit(msg) {
                        warn!(%err, "admission failed");
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// Sample every row, mutate sequences, and retire finished ones.
    fn process_batch(&mut self, plan: &BatchPlan, logits: &candle_core::Tensor) -> Result<Vec<StepEvent>> {
        let mut events = Vec::new();
        let max_context_len = self.scheduler.max_context_len();

        for (row_idx, span) in plan.sequences.iter().enumerate() {
            let key = span.request_key;
            // A cancel that landed mid-execute discards this row's result.
            let Some(request) = self.scheduler.request(key) else {
                continue;
            };
            if request.is_cancel_requested() || request.status() == RequestStatus::Cancelled {
                continue;
            }

            let row = logits.i(row_idx)?;
            let sampled = {
                let Some(seq) = self.scheduler.sequence_mut(span.seq_id) else {
                    continue;
                };
                if seq.is_finished() {
                    continue;
                }
                self.sampler.sample_row(&row, seq)
            };
            let sampled = match sampled {
                Ok(sampled) => sampled,
                Err(err) => {
                    warn!(seq = span.seq_id, %err, "sampling failed");
                    let (text, _) = self.flush_sequence_tail(span.seq_id);
                    self.retire_sequence(span.seq_id, FinishReason::Error)?;
                    events.push(StepEvent {
                        key,
                        index: span.index,
                        text,
                        finish: Some(FinishReason::Error),
                    });
                    continue;
                }
            };

            let params = {
                let seq = self
                    .scheduler
                    .sequence_mut(span.seq_id)
                    .ok_or(Error::SequenceNotFound(span.seq_id))?;
                seq.append_token(sampled.token_id, sampled.logprob);
                seq.sampling().clone()
            };
            EngineMetrics::incr(&self.metrics.tokens_generated);
            if span.is_prefill {
                self.scheduler.complete_prefill(span.seq_id)?;
            }

            // Detokenize, scan for stop strings, and decide termination in
            // precedence order: token stop, string stop, then length.
            let mut finish: Option<FinishReason> = None;
            let mut delta = String::new();

            let is_token_stop = {
                let seq = self
                    .scheduler
                    .sequence_mut(span.seq_id)
                    .ok_or(Error::SequenceNotFound(span.seq_id))?;
                seq.is_stop_token(sampled.token_id, self.eos_token_id)
            };
            if is_token_stop {
                finish = Some(FinishReason::Stop);
            } else {
                let decoded = self.push_stream_token(span.seq_id, sampled.token_id, &params)?;
                if let Some(text) = decoded {
                    let seq = self
                        .scheduler
                        .sequence_mut(span.seq_id)
                        .ok_or(Error::SequenceNotFound(span.seq_id))?;
                    let scan = seq.stop_state_mut().push(&text);
                    let visible = scan.emit;
                    delta.push_str(&seq.push_output_text(&visible));
                    if scan.matched {
                        finish = Some(FinishReason::Stop);
                    }
                }
            }
            if finish.is_none() {
                let seq = self
                    .scheduler
                    .sequence_mut(span.seq_id)
                    .ok_or(Error::SequenceNotFound(span.seq_id))?;
                if seq.hit_length_limit(max_context_len) {
                    finish = Some(FinishReason::Length);
                }
            }

            if let Some(reason) = finish {
                if reason != FinishReason::Stop || is_token_stop {
                    // Flush the held-back window; a string stop already
                    // truncated it.
                    let (tail, _) = self.flush_sequence_tail(span.seq_id);
                    delta.push_str(&tail);
                }
                self.retire_sequence(span.seq_id, reason)?;
            }

            events.push(StepEvent {
                key,
                index: span.index,
                text: delta,
                finish,
            });
        }
        Ok(events)
    }

    /// Feed one token through the sequence's incremental decoder.
    fn push_stream_token(
        &mut self,
        seq_id: SequenceId,
        token_id: u32,
        params: &SamplingParams,
    ) -> Result<Option<String>> {
        let stream = match self.streams.entry(seq_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(self.tokenizer.new_stream(params.skip_special_tokens))
            }
        };
        stream.push(token_id)
    }

    /// Emit the stop-window remainder through the delivery watermark.
    fn flush_sequence_tail(&mut self, seq_id: SequenceId) -> (String, bool) {
        let Some(seq) = self.scheduler.sequence_mut(seq_id) else {
            return (String::new(), false);
        };
        let tail = seq.stop_state_mut().finish();
        let delta = seq.push_output_text(&tail);
        (delta, !tail.is_empty())
    }

    fn retire_sequence(&mut self, seq_id: SequenceId, reason: FinishReason) -> Result<()> {
        self.scheduler.finish_sequence(seq_id, reason)?;
        self.streams.remove(&seq_id);
        Ok(())
    }

    /// Deliver this step's events: streaming deltas ordered by sequence
    /// index within each request, then terminal events for requests that
    /// completed.
    fn fan_out(&mut self, mut events: Vec<StepEvent>) -> Result<()> {
        events.sort_by_key(|e| (e.key, e.index));

        let mut touched: Vec<RequestKey> = Vec::new();
        for event in events {
            if touched.last() != Some(&event.key) {
                touched.push(event.key);
            }
            let Some(request) = self.scheduler.request_mut(event.key) else {
                continue;
            };
            if !request.is_streaming() {
                continue;
            }
            let announce = request.take_announcement(event.index);
            let Some(queue) = self.queues.get(&event.key) else {
                continue;
            };
            if announce {
                queue.push(OutputEvent::Delta {
                    index: event.index,
                    text: String::new(),
                    finish_reason: None,
                });
            }
            if !event.text.is_empty() || event.finish.is_some() {
                queue.push(OutputEvent::Delta {
                    index: event.index,
                    text: event.text,
                    finish_reason: event.finish,
                });
            }
        }

        for key in touched {
            let Some(request) = self.scheduler.request(key) else {
                continue;
            };
            let finished = request.all_sequences_finished();
            let queue = self.queues.get(&key).cloned();
            if finished {
                // Streaming requests get the same terminal event after their
                // final deltas, so every sink sees a uniform end-of-request
                // signal.
                let event = final_event(request);
                if let Some(queue) = &queue {
                    queue.push(event);
                }
                EngineMetrics::incr(&self.metrics.requests_finished);
                self.drop_request(key);
            }
            if let Some(queue) = queue {
                let _ = self.notify_tx.send(queue);
            }
        }
        Ok(())
    }

    /// Cancel requests whose flag is set; resources release before the next
    /// step completes and a final cancelled event is the last the sink sees.
    fn service_cancellations(&mut self) -> Result<()> {
        for key in self.scheduler.pending_cancellations() {
            debug!(key, "servicing cancellation");
            let seq_ids: Vec<SequenceId> = self
                .scheduler
                .request(key)
                .map(|r| r.sequences().iter().map(|s| s.seq_id()).collect())
                .unwrap_or_default();
            for seq_id in seq_ids {
                self.flush_sequence_tail(seq_id);
            }
            self.scheduler.cancel_request(key)?;
            if let Some(request) = self.scheduler.request(key) {
                let event = final_event(request);
                if let Some(queue) = self.queues.get(&key) {
                    queue.push(event);
                }
            }
            if let Some(queue) = self.queues.get(&key) {
                let _ = self.notify_tx.send(queue.clone());
            }
            self.drop_request(key);
        }
        Ok(())
    }

    /// A sink that stopped draining past its grace period cancels its
    /// request; the scheduler thread itself never waits on delivery.
    fn enforce_backpressure(&mut self) {
        let now = Instant::now();
        for (&key, queue) in &self.queues {
            if queue.len() <= queue.capacity {
                self.backpressure.remove(&key);
                continue;
            }
            let since = *self.backpressure.entry(key).or_insert(now);
            if now.duration_since(since) > self.backpressure_grace {
                warn!(key, "output back-pressure exceeded grace; cancelling");
                queue.cancel.store(true, Ordering::Release);
            }
        }
    }

    /// Mark every sequence of the failed batch with an `error` finish,
    /// release blocks, and deliver what each request had produced so far.
    fn fail_batch(&mut self, plan: &BatchPlan) -> Result<()> {
        let mut keys: Vec<RequestKey> = Vec::new();
        for span in &plan.sequences {
            if self.scheduler.sequence(span.seq_id).is_some() {
                self.flush_sequence_tail(span.seq_id);
                self.retire_sequence(span.seq_id, FinishReason::Error)?;
            }
            if keys.last() != Some(&span.request_key) {
                keys.push(span.request_key);
            }
        }
        for key in keys {
            self.finish_request_with_errors(key);
        }
        Ok(())
    }

    /// Fatal path: every live request is failed before the thread exits.
    fn fail_all(&mut self, err: &Error) {
        for key in self.scheduler.request_keys() {
            let seq_ids: Vec<SequenceId> = self
                .scheduler
                .request(key)
                .map(|r| {
                    r.sequences()
                        .iter()
                        .filter(|s| !s.is_finished())
                        .map(|s| s.seq_id())
                        .collect()
                })
                .unwrap_or_default();
            for seq_id in seq_ids {
                self.flush_sequence_tail(seq_id);
                if let Err(finish_err) = self.retire_sequence(seq_id, FinishReason::Error) {
                    warn!(%finish_err, "failed to retire sequence during shutdown");
                }
            }
            self.finish_request_with_errors(key);
        }
        warn!(%err, "all in-flight requests failed");
    }

    /// Deliver a terminal event for a request whose sequences were all
    /// force-finished, then drop it.
    fn finish_request_with_errors(&mut self, key: RequestKey) {
        if let Some(request) = self.scheduler.request(key) {
            if request.all_sequences_finished() {
                let event = final_event(request);
                if let Some(queue) = self.queues.get(&key) {
                    queue.push(event);
                    let _ = self.notify_tx.send(queue.clone());
                }
                self.drop_request(key);
            }
        }
    }

    fn drop_request(&mut self, key: RequestKey) {
        if let Some(request) = self.scheduler.remove_request(key) {
            for seq in request.sequences() {
                self.streams.remove(&seq.seq_id());
            }
        }
        self.queues.remove(&key);
        self.backpressure.remove(&key);
    }
}

/// Terminal event for a fully finished request: the chosen outputs plus
/// token accounting. Partial progress is preserved on error and
/// cancellation paths.
fn final_event(request: &crate::core::request::Request) -> OutputEvent {
    let chosen = request.chosen_indices();
    let outputs: Vec<SequenceOutput> = chosen
        .iter()
        .map(|&i| {
            let seq = request.sequence(i);
            SequenceOutput {
                index: seq.index(),
                text: seq.output_text().to_string(),
                finish_reason: seq.finish_reason(),
            }
        })
        .collect();
    let (prompt_tokens, completion_tokens) = request.usage(&chosen);
    OutputEvent::Finished {
        outputs,
        usage: Usage::new(prompt_tokens, completion_tokens),
    }
}
