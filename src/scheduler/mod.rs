//! Continuous batching scheduler.
//!
//! The scheduler owns every piece of mutable core state: the request table,
//! the waiting/running/swapped pools, and the block manager. Each step it
//! selects a batch under the token and block budgets, preempting running
//! requests when the pool runs dry and re-admitting them later.
//!
//! Selection order per step:
//! 1. decode spans for running sequences, FIFO;
//! 2. swapped requests, resumed when capacity returned;
//! 3. prefill spans for waiting requests, priority then FIFO.
//!
//! Everything here runs on the single scheduler thread; no locking.

pub mod batch;
pub mod queue;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{EngineConfig, PreemptionMode, SamplingParams};
use crate::core::block::{blocks_needed, BlockTable};
use crate::core::block_manager::BlockManager;
use crate::core::request::{Priority, Request, RequestKey, RequestStatus};
use crate::core::sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use batch::{BatchPlan, PlanBuilder};
use queue::WaitingQueue;

/// What one scheduling pass decided.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// The batch to execute, or `None` when no sequence could make progress.
    pub plan: Option<BatchPlan>,
    /// Requests evicted while building this batch.
    pub preempted: Vec<RequestKey>,
}

/// Continuous batching scheduler over a paged block pool.
pub struct Scheduler {
    block_size: usize,
    max_batch_tokens: usize,
    max_seqs_per_batch: usize,
    preemption_mode: PreemptionMode,
    aging_threshold: Duration,
    prefill_skip_limit: u32,
    max_context_len: usize,
    block_manager: BlockManager,
    /// All live requests by internal key.
    requests: HashMap<RequestKey, Request>,
    /// Sequence id -> owning request and index within it.
    seq_index: HashMap<SequenceId, (RequestKey, usize)>,
    /// Admission pool, priority then FIFO.
    waiting: WaitingQueue,
    /// Decode pool, FIFO by first-run order.
    running: VecDeque<SequenceId>,
    /// Swap-preempted requests, FIFO.
    swapped: VecDeque<RequestKey>,
    next_seq_id: SequenceId,
    metrics: Arc<EngineMetrics>,
}

impl Scheduler {
    /// Create a scheduler over `num_blocks` device blocks.
    ///
    /// `num_blocks` is resolved by the engine (config override or the
    /// executor's reported KV capacity).
    pub fn new(
        config: &EngineConfig,
        num_blocks: usize,
        max_context_len: usize,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            block_size: config.block_size,
            max_batch_tokens: config.max_batch_tokens,
            max_seqs_per_batch: config.max_seqs_per_batch,
            preemption_mode: config.preemption_mode,
            aging_threshold: config.aging_threshold(),
            prefill_skip_limit: config.prefill_skip_limit,
            max_context_len,
            block_manager: BlockManager::new(num_blocks, config.num_host_blocks, config.block_size),
            requests: HashMap::new(),
            seq_index: HashMap::new(),
            waiting: WaitingQueue::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            next_seq_id: 1,
            metrics,
        }
    }

    // ========== Admission ==========

    /// Admit a request: materialize its `best_of` sequences and enqueue it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when the prompt cannot ever run:
    /// longer than the model context or larger than the whole block pool.
    #[allow(clippy::too_many_arguments)]
    pub fn admit(
        &mut self,
        key: RequestKey,
        id: String,
        priority: Priority,
        stream: bool,
        sampling: Arc<SamplingParams>,
        prompt_tokens: Vec<u32>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<()> {
        let prompt_len = prompt_tokens.len();
        if prompt_len == 0 {
            return Err(Error::invalid_request("empty prompt"));
        }
        if prompt_len >= self.max_context_len {
            return Err(Error::invalid_request(format!(
                "prompt of {prompt_len} tokens exceeds model context length {}",
                self.max_context_len
            )));
        }
        if blocks_needed(prompt_len, self.block_size) > self.block_manager.num_blocks() {
            return Err(Error::invalid_request(format!(
                "prompt of {prompt_len} tokens exceeds KV cache capacity"
            )));
        }

        let best_of = sampling.effective_best_of();
        let sequences: Vec<Sequence> = (0..best_of)
            .map(|index| {
                let seq_id = self.next_seq_id;
                self.next_seq_id += 1;
                self.seq_index.insert(seq_id, (key, index));
                Sequence::new(
                    seq_id,
                    index,
                    prompt_tokens.clone(),
                    sampling.clone(),
                    self.block_size,
                )
            })
            .collect();

        let request = Request::new(key, id, priority, stream, sampling, sequences, cancel_flag);
        self.waiting.push_back(key, priority);
        self.requests.insert(key, request);
        EngineMetrics::incr(&self.metrics.requests_admitted);
        Ok(())
    }

    // ========== Scheduling ==========

    /// Build the next batch.
    pub fn schedule(&mut self) -> Result<ScheduleOutcome> {
        self.promote_aged_waiters();

        let mut outcome = ScheduleOutcome::default();
        let mut in_plan: HashSet<RequestKey> = HashSet::new();
        let mut decode_selected: Vec<SequenceId> = Vec::new();
        let mut copies: Vec<(usize, usize)> = Vec::new();
        let mut swap_out_directives: Vec<(usize, usize)> = Vec::new();
        let mut swap_in_directives: Vec<(usize, usize)> = Vec::new();
        let mut num_tokens = 0usize;
        let mut num_seqs = 0usize;

        self.select_decodes(
            &mut in_plan,
            &mut decode_selected,
            &mut copies,
            &mut swap_out_directives,
            &mut outcome.preempted,
            &mut num_tokens,
            &mut num_seqs,
        )?;

        if outcome.preempted.is_empty() {
            self.resume_swapped(
                &mut in_plan,
                &mut decode_selected,
                &mut copies,
                &mut swap_in_directives,
                &mut num_tokens,
                &mut num_seqs,
            )?;
        }

        let mut prefill_selected: Vec<SequenceId> = Vec::new();
        self.select_prefills(&mut in_plan, &mut prefill_selected, &mut num_tokens, &mut num_seqs)?;

        if prefill_selected.is_empty()
            && decode_selected.is_empty()
            && swap_out_directives.is_empty()
        {
            return Ok(outcome);
        }

        // Prefill spans precede decode spans in the plan.
        let mut builder = PlanBuilder::new();
        for seq_id in prefill_selected {
            let (key, index) = self.locate(seq_id)?;
            builder.add_prefill(&self.requests[&key].sequences()[index], key);
        }
        for seq_id in decode_selected {
            let (key, index) = self.locate(seq_id)?;
            builder.add_decode(&self.requests[&key].sequences()[index], key);
        }
        for directive in copies {
            builder.add_copy(directive);
        }
        builder.add_swap_in(swap_in_directives);
        builder.add_swap_out(swap_out_directives);

        outcome.plan = Some(builder.finish());
        EngineMetrics::incr(&self.metrics.steps);
        Ok(outcome)
    }

    /// Decode pass: every running sequence contributes one token, FIFO,
    /// preempting when the pool cannot cover a sequence's growth.
    #[allow(clippy::too_many_arguments)]
    fn select_decodes(
        &mut self,
        in_plan: &mut HashSet<RequestKey>,
        selected: &mut Vec<SequenceId>,
        copies: &mut Vec<(usize, usize)>,
        swap_out: &mut Vec<(usize, usize)>,
        preempted: &mut Vec<RequestKey>,
        num_tokens: &mut usize,
        num_seqs: &mut usize,
    ) -> Result<()> {
        let mut kept = VecDeque::new();
        let mut blocked = false;

        while let Some(seq_id) = self.running.pop_front() {
            let Some(&(key, index)) = self.seq_index.get(&seq_id) else {
                continue; // request already removed
            };
            let Some(request) = self.requests.get(&key) else {
                continue;
            };
            {
                let seq = &request.sequences()[index];
                if seq.status() != SequenceStatus::Running || !seq.is_prefill_complete() {
                    kept.push_back(seq_id);
                    continue;
                }
            }
            if blocked
                || *num_tokens + 1 > self.max_batch_tokens
                || *num_seqs >= self.max_seqs_per_batch
            {
                kept.push_back(seq_id);
                continue;
            }

            // Reserve room for this sequence's next token, evicting another
            // request if the pool is dry.
            loop {
                let seq = &self.requests[&key].sequences()[index];
                let need = self
                    .block_manager
                    .blocks_needed_for_append(seq.block_table(), seq.total_len());
                if need <= self.block_manager.num_free_blocks() {
                    break;
                }
                in_plan.insert(key); // never evict the sequence being served
                let evicted = self.preempt_one(in_plan, preempted, swap_out, &mut kept)?;
                in_plan.remove(&key);
                if !evicted {
                    blocked = true;
                    break;
                }
            }
            if blocked {
                kept.push_back(seq_id);
                continue;
            }

            let seq = self
                .requests
                .get_mut(&key)
                .expect("request checked above")
                .sequences_mut()
                .get_mut(index)
                .expect("sequence index from seq_index");
            let len = seq.total_len();
            let outcome = self.block_manager.append_slot(seq.block_table_mut(), len)?;
            if let Some(directive) = outcome.copied {
                copies.push(directive);
            }
            selected.push(seq_id);
            *num_tokens += 1;
            *num_seqs += 1;
            in_plan.insert(key);
            kept.push_back(seq_id);
        }

        self.running = kept;
        Ok(())
    }

    /// Bring back swapped requests, oldest first, while capacity and budget
    /// allow. Resumed sequences decode in the same step.
    fn resume_swapped(
        &mut self,
        in_plan: &mut HashSet<RequestKey>,
        selected: &mut Vec<SequenceId>,
        copies: &mut Vec<(usize, usize)>,
        swap_in: &mut Vec<(usize, usize)>,
        num_tokens: &mut usize,
        num_seqs: &mut usize,
    ) -> Result<()> {
        while let Some(&key) = self.swapped.front() {
            let Some(request) = self.requests.get(&key) else {
                self.swapped.pop_front();
                continue;
            };
            let live: Vec<usize> = (0..request.sequences().len())
                .filter(|&i| !request.sequences()[i].is_finished())
                .collect();
            if live.is_empty() {
                self.swapped.pop_front();
                continue;
            }
            if *num_tokens + live.len() > self.max_batch_tokens
                || *num_seqs + live.len() > self.max_seqs_per_batch
            {
                break;
            }

            let tables: Vec<&BlockTable> = live
                .iter()
                .map(|&i| request.sequences()[i].block_table())
                .collect();
            let unique: usize = {
                let mut seen = HashSet::new();
                for t in &tables {
                    seen.extend(t.block_ids().iter().copied());
                }
                seen.len()
            };
            // Swapping in plus one decode slot per sequence must fit.
            if !self.block_manager.can_swap_in(&tables)
                || self.block_manager.num_free_blocks() < unique + live.len()
            {
                break;
            }

            self.swapped.pop_front();
            let mut tables = self.take_tables(key, &live);
            swap_in.extend(self.block_manager.swap_in(&mut tables)?);
            self.restore_tables(key, &live, tables);

            debug!(key, "resumed swapped request");
            let request = self.requests.get_mut(&key).expect("swapped request exists");
            request.set_status(RequestStatus::Running);
            for &i in &live {
                let seq = self
                    .requests
                    .get_mut(&key)
                    .expect("swapped request exists")
                    .sequences_mut()
                    .get_mut(i)
                    .expect("live index");
                seq.set_running()?;
                let seq_id = seq.seq_id();
                let len = seq.total_len();
                let outcome = self.block_manager.append_slot(seq.block_table_mut(), len)?;
                if let Some(directive) = outcome.copied {
                    copies.push(directive);
                }
                selected.push(seq_id);
                self.running.push_back(seq_id);
                *num_tokens += 1;
                *num_seqs += 1;
            }
            in_plan.insert(key);
        }
        Ok(())
    }

    /// Prefill pass: admit waiting requests while prompts fit the token and
    /// block budgets. The first request that does not fit is skip-counted
    /// and the pass ends, so admission order is preserved.
    fn select_prefills(
        &mut self,
        in_plan: &mut HashSet<RequestKey>,
        selected: &mut Vec<SequenceId>,
        num_tokens: &mut usize,
        num_seqs: &mut usize,
    ) -> Result<()> {
        let budget_left = self.max_batch_tokens.saturating_sub(*num_tokens);
        let smallest_prompt = self
            .waiting
            .keys_in_order()
            .iter()
            .filter_map(|key| self.requests.get(key))
            .map(Request::prompt_len)
            .min();
        match smallest_prompt {
            Some(smallest) if smallest <= budget_left => {}
            _ => return Ok(()),
        }

        for key in self.waiting.keys_in_order() {
            if *num_seqs >= self.max_seqs_per_batch {
                break;
            }
            let Some(request) = self.requests.get(&key) else {
                self.waiting.remove(key);
                continue;
            };
            let Some(prefill_index) = request
                .sequences()
                .iter()
                .position(|s| !s.is_finished() && !s.is_prefill_complete())
            else {
                // Nothing left to prefill; should not linger in waiting.
                self.waiting.remove(key);
                continue;
            };
            let prompt_len = request.prompt_len();
            let blocks = blocks_needed(prompt_len, self.block_size);

            if *num_tokens + prompt_len > self.max_batch_tokens
                || !self.block_manager.can_allocate(blocks)
            {
                if let Some(promoted) = self.waiting.record_skip(key, self.prefill_skip_limit) {
                    if let Some(request) = self.requests.get_mut(&key) {
                        request.set_priority(promoted);
                    }
                }
                break;
            }

            self.waiting.remove(key);
            let block_ids = self.block_manager.allocate_many(blocks)?;
            let request = self.requests.get_mut(&key).expect("waiting request exists");
            request.set_status(RequestStatus::Running);
            let seq = &mut request.sequences_mut()[prefill_index];
            for block_id in block_ids {
                seq.block_table_mut().append_block(block_id);
            }
            seq.set_running()?;
            let seq_id = seq.seq_id();
            selected.push(seq_id);
            self.running.push_back(seq_id);
            *num_tokens += prompt_len;
            *num_seqs += 1;
            in_plan.insert(key);
            EngineMetrics::add(&self.metrics.prompt_tokens, prompt_len as u64);
        }
        Ok(())
    }

    /// Evict one running request to reclaim blocks: lowest priority first,
    /// youngest arrival within a level. Requests already in the current plan
    /// are never victims.
    fn preempt_one(
        &mut self,
        exclude: &HashSet<RequestKey>,
        preempted: &mut Vec<RequestKey>,
        swap_out: &mut Vec<(usize, usize)>,
        kept: &mut VecDeque<SequenceId>,
    ) -> Result<bool> {
        let victim = self
            .requests
            .values()
            .filter(|r| r.status() == RequestStatus::Running && !exclude.contains(&r.key()))
            .min_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(b.arrival_time().cmp(&a.arrival_time()))
            })
            .map(Request::key);
        let Some(key) = victim else {
            return Ok(false);
        };

        let mode = self.preemption_mode;
        debug!(key, ?mode, "preempting request under block pressure");
        match mode {
            PreemptionMode::Recompute => self.preempt_by_recompute(key)?,
            PreemptionMode::Swap => {
                if !self.preempt_by_swap(key, swap_out)? {
                    // Host pool full; recompute is always possible.
                    warn!(key, "host pool exhausted, falling back to recompute");
                    self.preempt_by_recompute(key)?;
                }
            }
        }
        let victim_seqs: HashSet<SequenceId> = self
            .requests
            .get(&key)
            .map(|r| r.sequences().iter().map(Sequence::seq_id).collect())
            .unwrap_or_default();
        self.running.retain(|id| !victim_seqs.contains(id));
        kept.retain(|id| !victim_seqs.contains(id));
        preempted.push(key);
        EngineMetrics::incr(&self.metrics.preemptions);
        Ok(true)
    }

    /// Drop the victim's blocks and generated tokens; it re-prefills later.
    fn preempt_by_recompute(&mut self, key: RequestKey) -> Result<()> {
        let request = self
            .requests
            .get_mut(&key)
            .ok_or_else(|| Error::internal(format!("preempting unknown request {key}")))?;
        for seq in request.sequences_mut() {
            if seq.is_finished() {
                continue;
            }
            let mut table = std::mem::replace(seq.block_table_mut(), BlockTable::new(self.block_size));
            self.block_manager.free_table(&mut table);
            seq.reset_for_recompute();
        }
        request.reset_fork();
        request.set_status(RequestStatus::Preempted);
        let priority = request.priority();
        self.waiting.push_front(key, priority);
        Ok(())
    }

    /// Move the victim's blocks to the host pool; resumes from `swapped`.
    ///
    /// Returns `false` when the host pool cannot take the blocks.
    fn preempt_by_swap(
        &mut self,
        key: RequestKey,
        swap_out: &mut Vec<(usize, usize)>,
    ) -> Result<bool> {
        let request = self
            .requests
            .get(&key)
            .ok_or_else(|| Error::internal(format!("preempting unknown request {key}")))?;
        let live: Vec<usize> = (0..request.sequences().len())
            .filter(|&i| !request.sequences()[i].is_finished())
            .collect();
        {
            let tables: Vec<&BlockTable> = live
                .iter()
                .map(|&i| request.sequences()[i].block_table())
                .collect();
            if !self.block_manager.can_swap_out(&tables) {
                return Ok(false);
            }
        }
        let mut tables = self.take_tables(key, &live);
        swap_out.extend(self.block_manager.swap_out(&mut tables)?);
        self.restore_tables(key, &live, tables);

        let request = self.requests.get_mut(&key).expect("request checked above");
        for &i in &live {
            request.sequences_mut()[i].set_swapped()?;
        }
        request.set_status(RequestStatus::Preempted);
        self.swapped.push_back(key);
        EngineMetrics::incr(&self.metrics.swap_outs);
        Ok(true)
    }

    /// Temporarily move the block tables of `live` sequences out of a
    /// request so the block manager can rewrite them as a group.
    fn take_tables(&mut self, key: RequestKey, live: &[usize]) -> Vec<BlockTable> {
        let request = self.requests.get_mut(&key).expect("request exists");
        live.iter()
            .map(|&i| {
                std::mem::replace(
                    request.sequences_mut()[i].block_table_mut(),
                    BlockTable::default(),
                )
            })
            .collect()
    }

    fn restore_tables(&mut self, key: RequestKey, live: &[usize], tables: Vec<BlockTable>) {
        let request = self.requests.get_mut(&key).expect("request exists");
        for (&i, table) in live.iter().zip(tables) {
            *request.sequences_mut()[i].block_table_mut() = table;
        }
    }

    fn promote_aged_waiters(&mut self) {
        let now = std::time::Instant::now();
        for (key, priority) in self.waiting.promote_aged(self.aging_threshold, now) {
            if let Some(request) = self.requests.get_mut(&key) {
                request.set_priority(priority);
            }
        }
    }

    // ========== Step bookkeeping driven by the engine ==========

    /// Mark a freshly executed prefill sequence as cached and, once the
    /// request's prompt is materialized, fork the remaining siblings from it
    /// copy-on-write.
    pub fn complete_prefill(&mut self, seq_id: SequenceId) -> Result<()> {
        let (key, index) = self.locate(seq_id)?;
        let request = self
            .requests
            .get_mut(&key)
            .ok_or_else(|| Error::internal(format!("prefill for unknown request {key}")))?;
        request.sequences_mut()[index].mark_prefilled();

        if request.is_forked() {
            return Ok(());
        }
        let src_ids: Vec<usize> = request.sequences()[index]
            .block_table()
            .block_ids()
            .to_vec();
        let siblings: Vec<usize> = (0..request.sequences().len())
            .filter(|&i| {
                i != index
                    && !request.sequences()[i].is_finished()
                    && !request.sequences()[i].is_prefill_complete()
            })
            .collect();
        for i in siblings {
            let shared = self.block_manager.fork(&src_ids)?;
            let request = self.requests.get_mut(&key).expect("located request");
            let seq = &mut request.sequences_mut()[i];
            for id in shared {
                seq.block_table_mut().append_block(id);
            }
            seq.mark_prefilled();
            seq.set_running()?;
            let sibling_id = seq.seq_id();
            self.running.push_back(sibling_id);
            debug!(key, sibling = sibling_id, "forked sibling from prompt prefix");
        }
        self.requests
            .get_mut(&key)
            .expect("located request")
            .set_forked();
        Ok(())
    }

    /// Finish one sequence and release its blocks in the same step.
    pub fn finish_sequence(&mut self, seq_id: SequenceId, reason: FinishReason) -> Result<()> {
        let (key, index) = self.locate(seq_id)?;
        let request = self
            .requests
            .get_mut(&key)
            .ok_or_else(|| Error::internal(format!("finish for unknown request {key}")))?;
        let seq = &mut request.sequences_mut()[index];
        let was_swapped = seq.status() == SequenceStatus::Swapped;
        seq.set_finished(reason);
        let mut table = std::mem::take(seq.block_table_mut());
        if was_swapped {
            self.block_manager.free_host_table(&mut table);
        } else {
            self.block_manager.free_table(&mut table);
        }
        self.running.retain(|&id| id != seq_id);
        Ok(())
    }

    /// Requests whose cancel flag is set and that still need servicing.
    pub fn pending_cancellations(&self) -> Vec<RequestKey> {
        self.requests
            .values()
            .filter(|r| {
                r.is_cancel_requested()
                    && !matches!(r.status(), RequestStatus::Finished | RequestStatus::Cancelled)
            })
            .map(Request::key)
            .collect()
    }

    /// Cancel a request: finish every live sequence with `Cancelled` and
    /// release all resources.
    pub fn cancel_request(&mut self, key: RequestKey) -> Result<()> {
        let Some(request) = self.requests.get(&key) else {
            return Ok(());
        };
        let seq_ids: Vec<SequenceId> = request
            .sequences()
            .iter()
            .filter(|s| !s.is_finished())
            .map(Sequence::seq_id)
            .collect();
        for seq_id in seq_ids {
            self.finish_sequence(seq_id, FinishReason::Cancelled)?;
        }
        if let Some(request) = self.requests.get_mut(&key) {
            request.set_status(RequestStatus::Cancelled);
        }
        self.waiting.remove(key);
        self.swapped.retain(|&k| k != key);
        EngineMetrics::incr(&self.metrics.requests_cancelled);
        Ok(())
    }

    /// Drop a request once its final output went out.
    pub fn remove_request(&mut self, key: RequestKey) -> Option<Request> {
        let request = self.requests.remove(&key)?;
        for seq in request.sequences() {
            self.seq_index.remove(&seq.seq_id());
            self.running.retain(|&id| id != seq.seq_id());
        }
        self.waiting.remove(key);
        self.swapped.retain(|&k| k != key);
        Some(request)
    }

    // ========== Accessors ==========

    pub fn request(&self, key: RequestKey) -> Option<&Request> {
        self.requests.get(&key)
    }

    pub fn request_mut(&mut self, key: RequestKey) -> Option<&mut Request> {
        self.requests.get_mut(&key)
    }

    pub fn sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        let &(key, index) = self.seq_index.get(&seq_id)?;
        self.requests.get(&key).map(|r| &r.sequences()[index])
    }

    pub fn sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        let &(key, index) = self.seq_index.get(&seq_id)?;
        self.requests
            .get_mut(&key)
            .map(|r| &mut r.sequences_mut()[index])
    }

    fn locate(&self, seq_id: SequenceId) -> Result<(RequestKey, usize)> {
        self.seq_index
            .get(&seq_id)
            .copied()
            .ok_or(Error::SequenceNotFound(seq_id))
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    /// Whether any admitted request still needs steps.
    pub fn has_unfinished_work(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    /// Live requests, for failure fan-out.
    pub fn request_keys(&self) -> Vec<RequestKey> {
        self.requests.keys().copied().collect()
    }
}
