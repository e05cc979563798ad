//! End-to-end engine tests against stub executors.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use inference_core::config::{EngineConfig, SamplingParams};
use inference_core::core::sequence::FinishReason;
use inference_core::engine::llm::{GenerationRequest, LlmEngine};
use inference_core::engine::output::{ErrorCode, OutputEvent, RequestHandle};
use inference_core::tokenizer::Tokenizer;

use common::{CharTokenizer, CollectingSink, EchoExecutor, ScriptedExecutor};

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> EngineConfig {
    EngineConfig {
        block_size: 4,
        num_blocks: 64,
        max_batch_tokens: 256,
        max_seqs_per_batch: 16,
        admission_queue_capacity: 64,
        output_queue_capacity: 1024,
        backpressure_grace_ms: 1000,
        step_timeout_ms: 50,
        ..EngineConfig::default()
    }
}

fn echo_engine(config: EngineConfig) -> LlmEngine {
    common::init_tracing();
    LlmEngine::new(
        config,
        Box::new(EchoExecutor::new()),
        Arc::new(CharTokenizer),
        None,
    )
    .unwrap()
}

/// The echoing stub always continues with the successor character.
fn echo_completion(prompt: &str, len: usize) -> String {
    let mut last = prompt.chars().last().unwrap() as u32;
    (0..len)
        .map(|_| {
            last = (last + 1) % common::VOCAB as u32;
            char::from_u32(last).unwrap()
        })
        .collect()
}

fn finished_outputs(event: &OutputEvent) -> &[inference_core::engine::output::SequenceOutput] {
    match event {
        OutputEvent::Finished { outputs, .. } => outputs,
        other => panic!("expected Finished, got {other:?}"),
    }
}

#[test]
fn test_single_greedy_request() {
    let engine = echo_engine(test_config());
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("A")
        .with_sampling(SamplingParams::greedy().with_max_tokens(3).with_seed(0));
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let terminal = sink.terminal().unwrap();
    let outputs = finished_outputs(&terminal);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].text, "BCD");
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Length));

    let OutputEvent::Finished { usage, .. } = terminal else {
        unreachable!()
    };
    assert_eq!(usage.prompt_tokens, 1);
    assert_eq!(usage.completion_tokens, 3);
    assert_eq!(usage.total_tokens, 4);
}

#[test]
fn test_max_tokens_one_yields_exactly_one_token() {
    let engine = echo_engine(test_config());
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("A")
        .with_sampling(SamplingParams::greedy().with_max_tokens(1).with_seed(0));
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let terminal = sink.terminal().unwrap();
    let outputs = finished_outputs(&terminal);
    assert_eq!(outputs[0].text, "B");
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Length));
    let OutputEvent::Finished { usage, .. } = terminal else {
        unreachable!()
    };
    assert_eq!(usage.completion_tokens, 1);
}

#[test]
fn test_stop_string_truncates_output() {
    let prompt = "hi";
    let engine = LlmEngine::new(
        test_config(),
        Box::new(ScriptedExecutor::new(prompt.len(), "there!world")),
        Arc::new(CharTokenizer),
        None,
    )
    .unwrap();
    let sink = CollectingSink::new();
    let request = GenerationRequest::new(prompt).with_sampling(
        SamplingParams::greedy()
            .with_max_tokens(20)
            .with_stop(["!"]),
    );
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let terminal = sink.terminal().unwrap();
    let outputs = finished_outputs(&terminal);
    assert_eq!(outputs[0].text, "there");
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_preemption_matches_sequential_outputs() {
    let mut config = test_config();
    config.num_blocks = 4;
    let engine = echo_engine(config);

    let prompts = ["ABCDEFGH", "MNOP", "WXYZ"];
    let sinks: Vec<CollectingSink> = prompts.iter().map(|_| CollectingSink::new()).collect();
    for (prompt, sink) in prompts.iter().zip(&sinks) {
        let request = GenerationRequest::new(*prompt)
            .with_sampling(SamplingParams::greedy().with_max_tokens(8).with_seed(0));
        engine.submit(request, sink.sink());
    }

    for (prompt, sink) in prompts.iter().zip(&sinks) {
        assert!(
            sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)),
            "request for {prompt} did not finish"
        );
        let terminal = sink.terminal().unwrap();
        let outputs = finished_outputs(&terminal);
        assert_eq!(outputs[0].text, echo_completion(prompt, 8));
        assert_eq!(outputs[0].finish_reason, Some(FinishReason::Length));
    }
    let metrics = engine.metrics();
    assert!(metrics.preemptions >= 1, "4 blocks must force a preemption");
}

#[test]
fn test_best_of_returns_single_choice() {
    let engine = echo_engine(test_config());
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("x").with_sampling(
        SamplingParams::default()
            .with_n(1)
            .with_best_of(3)
            .with_max_tokens(4)
            .with_seed(0),
    );
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let terminal = sink.terminal().unwrap();
    let outputs = finished_outputs(&terminal);
    assert_eq!(outputs.len(), 1, "best_of delivers only n choices");
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Length));

    let OutputEvent::Finished { usage, .. } = terminal else {
        unreachable!()
    };
    assert_eq!(usage.prompt_tokens, 1);
    assert_eq!(usage.completion_tokens, 4);
}

#[test]
fn test_best_of_one_matches_plain_path() {
    let engine = echo_engine(test_config());
    let params = SamplingParams::default()
        .with_max_tokens(4)
        .with_temperature(0.8)
        .with_seed(7);

    let run = |with_best_of: bool| {
        let sink = CollectingSink::new();
        let mut params = params.clone();
        if with_best_of {
            params.best_of = Some(1);
        }
        let request = GenerationRequest::new("seed").with_sampling(params);
        engine.submit(request, sink.sink());
        assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
        finished_outputs(&sink.terminal().unwrap())[0].text.clone()
    };

    assert_eq!(run(false), run(true));
}

#[test]
fn test_cancellation_mid_stream() {
    let prompt = "go";
    let executor = ScriptedExecutor::new(prompt.len(), "abcdefghijklmnopqrstuvwxyz")
        .with_delay(Duration::from_millis(5));
    let engine = LlmEngine::new(test_config(), Box::new(executor), Arc::new(CharTokenizer), None)
        .unwrap();

    let handle_cell: Arc<Mutex<Option<RequestHandle>>> = Arc::new(Mutex::new(None));
    let sink = CollectingSink::new();
    let events = sink.clone();
    let cell = handle_cell.clone();
    let counting_sink = {
        let mut deltas = 0usize;
        move |event: OutputEvent| {
            if matches!(event, OutputEvent::Delta { .. }) {
                deltas += 1;
                if deltas >= 5 {
                    if let Some(handle) = cell.lock().unwrap().as_ref() {
                        handle.cancel();
                    }
                }
            }
            let mut sink = events.sink();
            inference_core::engine::output::OutputSink::deliver(&mut sink, event)
        }
    };

    let request = GenerationRequest::new(prompt)
        .with_sampling(SamplingParams::greedy().with_max_tokens(1000))
        .streaming(true);
    let handle = engine.submit(request, counting_sink);
    *handle_cell.lock().unwrap() = Some(handle);

    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let all = sink.events();
    let terminal_pos = all.iter().position(OutputEvent::is_terminal).unwrap();
    let outputs = finished_outputs(&all[terminal_pos]);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Cancelled));
    assert!(
        outputs[0].text.len() < 1000,
        "cancellation must land well before max_tokens"
    );

    // No further events after the terminal one.
    std::thread::sleep(Duration::from_millis(100));
    let after = sink.events();
    assert_eq!(after.len(), terminal_pos + 1);
}

#[test]
fn test_streaming_completion_reaches_terminal_event() {
    let engine = echo_engine(test_config());
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("A")
        .with_sampling(SamplingParams::greedy().with_max_tokens(3).with_seed(0))
        .streaming(true);
    engine.submit(request, sink.sink());

    // A plain streaming finish must satisfy the is_terminal contract.
    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let all = sink.events();
    let terminal_pos = all.iter().position(OutputEvent::is_terminal).unwrap();
    assert_eq!(terminal_pos, all.len() - 1, "terminal event arrives last");

    let outputs = finished_outputs(&all[terminal_pos]);
    assert_eq!(outputs[0].text, "BCD");
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Length));

    // The last delta carried the finish reason, and the streamed text
    // reassembles the final text exactly.
    let deltas: Vec<&OutputEvent> = all[..terminal_pos]
        .iter()
        .filter(|e| matches!(e, OutputEvent::Delta { .. }))
        .collect();
    assert!(matches!(
        deltas.last().unwrap(),
        OutputEvent::Delta {
            finish_reason: Some(FinishReason::Length),
            ..
        }
    ));
    let streamed: String = deltas
        .iter()
        .filter_map(|e| match e {
            OutputEvent::Delta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "BCD");
}

#[test]
fn test_multi_sequence_delta_ordering() {
    let engine = echo_engine(test_config());
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("q")
        .with_sampling(
            SamplingParams::greedy()
                .with_n(3)
                .with_max_tokens(3)
                .with_seed(0),
        )
        .streaming(true);
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    OutputEvent::Delta {
                        finish_reason: Some(_),
                        ..
                    }
                )
            })
            .count()
            == 3
    }));

    let deltas: Vec<(usize, Option<FinishReason>)> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            OutputEvent::Delta {
                index,
                finish_reason,
                ..
            } => Some((*index, *finish_reason)),
            _ => None,
        })
        .collect();

    // Every sequence announces before any later-indexed sequence does.
    let first_seen: Vec<usize> = {
        let mut seen = Vec::new();
        for (index, _) in &deltas {
            if !seen.contains(index) {
                seen.push(*index);
            }
        }
        seen
    };
    assert_eq!(first_seen, vec![0, 1, 2]);

    // Finish deltas also arrive index-ordered.
    let finish_order: Vec<usize> = deltas
        .iter()
        .filter(|(_, f)| f.is_some())
        .map(|(i, _)| *i)
        .collect();
    assert_eq!(finish_order, vec![0, 1, 2]);
}

#[test]
fn test_oversized_prompt_rejected() {
    let engine = LlmEngine::new(
        test_config(),
        Box::new(EchoExecutor::new().with_max_context(16)),
        Arc::new(CharTokenizer),
        None,
    )
    .unwrap();
    let sink = CollectingSink::new();
    let prompt: String = std::iter::repeat('a').take(32).collect();
    engine.submit(GenerationRequest::new(prompt), sink.sink());

    assert!(sink.wait_until(WAIT, |events| !events.is_empty()));
    match &sink.events()[0] {
        OutputEvent::Error { code, .. } => assert_eq!(*code, ErrorCode::InvalidRequest),
        other => panic!("expected Error event, got {other:?}"),
    }
}

#[test]
fn test_streaming_with_best_of_rejected() {
    let engine = echo_engine(test_config());
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("a")
        .with_sampling(SamplingParams::default().with_n(1).with_best_of(2))
        .streaming(true);
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| !events.is_empty()));
    assert!(matches!(
        sink.events()[0],
        OutputEvent::Error {
            code: ErrorCode::InvalidRequest,
            ..
        }
    ));
}

#[test]
fn test_identical_seeds_yield_identical_outputs() {
    let engine = echo_engine(test_config());
    let run = || {
        let sink = CollectingSink::new();
        let request = GenerationRequest::new("det").with_sampling(
            SamplingParams::default()
                .with_temperature(0.8)
                .with_max_tokens(8)
                .with_seed(42),
        );
        engine.submit(request, sink.sink());
        assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
        finished_outputs(&sink.terminal().unwrap())[0].text.clone()
    };

    assert_eq!(run(), run());
}

#[test]
fn test_engine_failure_fails_batch_with_partial_output() {
    let engine = LlmEngine::new(
        test_config(),
        Box::new(EchoExecutor::new().failing_on(2)),
        Arc::new(CharTokenizer),
        None,
    )
    .unwrap();
    let sink = CollectingSink::new();
    let request = GenerationRequest::new("A")
        .with_sampling(SamplingParams::greedy().with_max_tokens(8).with_seed(0));
    engine.submit(request, sink.sink());

    assert!(sink.wait_until(WAIT, |events| events.iter().any(OutputEvent::is_terminal)));
    let terminal = sink.terminal().unwrap();
    let outputs = finished_outputs(&terminal);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Error));
    // The prefill step succeeded, so one token of progress is preserved.
    assert_eq!(outputs[0].text, "B");
    let metrics = engine.metrics();
    assert_eq!(metrics.engine_errors, 1);
}

#[test]
fn test_char_tokenizer_round_trip() {
    // Sanity-check the test double itself.
    let tokenizer = CharTokenizer;
    let tokens = tokenizer.encode("hello").unwrap();
    assert_eq!(tokenizer.decode(&tokens, true).unwrap(), "hello");
}
