//! The reasoning loop itself.
//!
//! One `run_task` drives one task to a terminal state. Per round: stream a
//! completion with stop sequences armed, classify the turn from parser
//! events, intercept the first tool invocation (or the first two inside a
//! `<parallel>` block), execute it for real, inject the genuine result into
//! history, and go again. Fabricated results are cut out of the stream the
//! moment they appear.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::codec::parser::{ResponseEvent, StreamParser};
use crate::codec::{PromptBuilder, stop_sequences};
use crate::engine::params::resolve_parameters;
use crate::engine::{EngineConfig, EngineResult, EngineState};
use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, LlmProvider, StopReason, StreamChunk, Usage, cost_micros,
};
use crate::orchestrator::{
    Capability, CatalogEntry, Invocation, InvocationStatus, InvokeRequest, Invoker, error_record,
};
use crate::task::{ErrorKind, Step, Task, TrajectoryStatus};
use crate::trajectory::{TrajectoryHandle, TrajectoryRecorder};

/// Backoff before the single tool-dispatch retry.
const DISPATCH_RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// Concurrent dispatches accepted inside a `<parallel>` block.
const MAX_PARALLEL_CALLS: usize = 2;

const NUDGE_NO_ACTION: &str = "Your last message contained neither a tool call nor a final \
     answer. Either call exactly one tool, or give your final answer inside \
     <answer></answer> tags.";
const NUDGE_FABRICATED: &str = "Your last message included a <result> block. Results are only \
     produced by real tool execution; never write them yourself. Everything after your \
     fabricated result was discarded. Continue from the genuine results above, or give your \
     final answer inside <answer></answer> tags.";

/// One tool call as intercepted from the stream.
#[derive(Debug, Clone)]
struct ParsedCall {
    server_id: String,
    action: String,
    raw_params: String,
}

/// Everything one assistant turn produced.
#[derive(Debug, Default)]
struct TurnParse {
    thinks: Vec<String>,
    answer: Option<String>,
    calls: Vec<ParsedCall>,
    parallel: bool,
    fabricated: bool,
    repairs: u32,
    usage: Usage,
    duration_ms: u64,
}

enum TurnOutcome {
    Parsed(TurnParse),
    /// No token within the idle window.
    Stalled,
    /// Provider error after its own retries.
    ProviderFailed(String),
    Cancelled,
    DeadlineExceeded,
}

enum DispatchOutcome {
    Done(Invocation),
    Cancelled,
    DeadlineExceeded,
}

/// Drives tasks through the reason→act loop.
pub struct ReasoningEngine {
    llm: Arc<dyn LlmProvider>,
    invoker: Arc<dyn Invoker>,
    config: EngineConfig,
}

impl ReasoningEngine {
    pub fn new(llm: Arc<dyn LlmProvider>, invoker: Arc<dyn Invoker>, config: EngineConfig) -> Self {
        Self {
            llm,
            invoker,
            config,
        }
    }

    /// Run one task to a terminal state, recording steps as they happen.
    pub async fn run_task(
        &self,
        task: &Task,
        preamble: Option<String>,
        recorder: &TrajectoryRecorder,
        handle: &mut TrajectoryHandle,
        cancel: CancellationToken,
    ) -> EngineResult {
        let deadline = Instant::now() + Duration::from_secs(task.timeout_seconds);
        let catalog = self.invoker.catalog().await;
        let mut run = Run {
            engine: self,
            task,
            deadline,
            cancel,
            catalog,
            recorder,
            handle,
            steps: Vec::new(),
            next_step_id: 0,
            turns: 0,
            history: Vec::new(),
        };
        run.next_step_id = run.handle.last_step_id() + 1;
        run.history = PromptBuilder::build(&task.description, &run.catalog, preamble.as_deref());
        run.drive().await
    }
}

/// Per-task mutable state for one engine run.
struct Run<'a> {
    engine: &'a ReasoningEngine,
    task: &'a Task,
    deadline: Instant,
    cancel: CancellationToken,
    catalog: Vec<CatalogEntry>,
    recorder: &'a TrajectoryRecorder,
    handle: &'a mut TrajectoryHandle,
    steps: Vec<Step>,
    next_step_id: u32,
    /// Assistant-turns consumed (the step budget counts these).
    turns: u32,
    history: Vec<ChatMessage>,
}

impl Run<'_> {
    async fn drive(&mut self) -> EngineResult {
        let mut state = EngineState::AwaitModel;
        let mut turn: Option<TurnParse> = None;
        let mut pending_results: Vec<String> = Vec::new();
        let mut completed: Option<EngineResult> = None;

        loop {
            match state {
                EngineState::AwaitModel => {
                    if self.cancel.is_cancelled() {
                        completed = Some(self.terminal_cancelled().await);
                        state = EngineState::Complete;
                    } else if Instant::now() >= self.deadline {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::TaskTimeout,
                                "wall-clock budget exhausted",
                                TrajectoryStatus::Timeout,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                    } else if self.turns >= self.task.max_steps {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::StepCap,
                                format!("no answer after {} assistant-turns", self.turns),
                                TrajectoryStatus::Failed,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                    } else {
                        state = EngineState::Streaming;
                    }
                }

                EngineState::Streaming => match self.run_turn().await {
                    TurnOutcome::Parsed(parsed) => {
                        turn = Some(parsed);
                        state = EngineState::Parsed;
                    }
                    TurnOutcome::Stalled => {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::ProviderStalled,
                                format!(
                                    "no tokens for {:?}",
                                    self.engine.config.provider_idle_timeout
                                ),
                                TrajectoryStatus::Failed,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                    }
                    TurnOutcome::ProviderFailed(reason) => {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::ProviderStalled,
                                reason,
                                TrajectoryStatus::Failed,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                    }
                    TurnOutcome::Cancelled => {
                        completed = Some(self.terminal_cancelled().await);
                        state = EngineState::Complete;
                    }
                    TurnOutcome::DeadlineExceeded => {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::TaskTimeout,
                                "wall-clock budget exhausted mid-stream",
                                TrajectoryStatus::Timeout,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                    }
                },

                EngineState::Parsed => {
                    let Some(parsed) = turn.take() else {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::UnparseableOutput,
                                "turn lost",
                                TrajectoryStatus::Failed,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                        continue;
                    };
                    self.turns += 1;

                    if parsed.repairs >= self.engine.config.repair_threshold {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::UnparseableOutput,
                                format!("{} parse repairs in one turn", parsed.repairs),
                                TrajectoryStatus::Failed,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                        continue;
                    }

                    // Scratch pad first; never trusted for control flow.
                    let attach_to_think =
                        parsed.answer.is_none() && parsed.calls.is_empty() && !parsed.fabricated;
                    let mut record_failed = None;
                    for (i, text) in parsed.thinks.iter().enumerate() {
                        let mut step = Step::think(self.next_step_id, text.clone());
                        if attach_to_think && i == parsed.thinks.len() - 1 {
                            step = self.with_turn_usage(step, &parsed);
                        }
                        if let Err(result) = self.record(step).await {
                            record_failed = Some(result);
                            break;
                        }
                    }
                    if let Some(result) = record_failed {
                        completed = Some(result);
                        state = EngineState::Complete;
                        continue;
                    }

                    if let Some(answer) = parsed.answer.clone() {
                        let step = self
                            .with_turn_usage(Step::answer(self.next_step_id, answer.clone()), &parsed);
                        completed = Some(match self.record(step).await {
                            Ok(()) => {
                                self.finish(TrajectoryStatus::Success, None, Some(answer)).await
                            }
                            Err(result) => result,
                        });
                        state = EngineState::Complete;
                    } else if !parsed.calls.is_empty() {
                        turn = Some(parsed);
                        state = EngineState::Dispatching;
                    } else {
                        if parsed.fabricated {
                            let step = self.with_turn_usage(
                                Step::error(
                                    self.next_step_id,
                                    ErrorKind::FabricatedResult,
                                    "model emitted a <result> block with no preceding tool call",
                                ),
                                &parsed,
                            );
                            if let Err(result) = self.record(step).await {
                                completed = Some(result);
                                state = EngineState::Complete;
                                continue;
                            }
                            self.history
                                .push(ChatMessage::assistant(render_thinks(&parsed.thinks)));
                            self.history.push(ChatMessage::user(NUDGE_FABRICATED));
                        } else {
                            self.history
                                .push(ChatMessage::assistant(render_thinks(&parsed.thinks)));
                            self.history.push(ChatMessage::user(NUDGE_NO_ACTION));
                        }
                        state = EngineState::AwaitModel;
                    }
                }

                EngineState::Dispatching => {
                    let Some(parsed) = turn.take() else {
                        completed = Some(
                            self.terminal_error(
                                ErrorKind::UnparseableOutput,
                                "turn lost",
                                TrajectoryStatus::Failed,
                            )
                            .await,
                        );
                        state = EngineState::Complete;
                        continue;
                    };

                    // Exactly one call per round; two inside <parallel>.
                    let limit = if parsed.parallel { MAX_PARALLEL_CALLS } else { 1 };
                    if parsed.calls.len() > limit {
                        tracing::debug!(
                            task = %self.task.task_id,
                            dropped = parsed.calls.len() - limit,
                            "model emitted extra tool calls; keeping the first {limit}"
                        );
                    }
                    let calls: Vec<ParsedCall> = parsed.calls.iter().take(limit).cloned().collect();
                    let prepared: Vec<PreparedCall> =
                        calls.iter().map(|call| self.prepare_call(call)).collect();

                    // History gets the canonical assistant turn before the
                    // results are appended to it.
                    self.history.push(ChatMessage::assistant(render_assistant_turn(
                        &parsed.thinks,
                        &prepared,
                        parsed.parallel,
                    )));

                    match self.dispatch_all(&parsed, prepared).await {
                        Ok(results) => {
                            pending_results = results;
                            state = EngineState::Injected;
                        }
                        Err(result) => {
                            completed = Some(result);
                            state = EngineState::Complete;
                        }
                    }
                }

                EngineState::Injected => {
                    if let Some(last) = self.history.last_mut() {
                        for result in pending_results.drain(..) {
                            last.content.push_str(&format!("\n<result>{result}</result>"));
                        }
                    }
                    state = EngineState::AwaitModel;
                }

                EngineState::Complete => {
                    return match completed.take() {
                        Some(result) => result,
                        None => self.finish(TrajectoryStatus::Failed, None, None).await,
                    };
                }
            }
        }
    }

    /// Stream one completion and classify the turn.
    async fn run_turn(&mut self) -> TurnOutcome {
        let turn_started = Instant::now();
        let request = CompletionRequest::new(self.history.clone())
            .with_stop_sequences(stop_sequences())
            .with_max_tokens(self.engine.config.max_tokens_per_turn);

        let mut stream = match self.engine.llm.stream(request).await {
            Ok(stream) => stream,
            Err(e) => return TurnOutcome::ProviderFailed(e.to_string()),
        };

        let mut parser = StreamParser::new();
        let mut parse = TurnParse::default();
        let mut stop: Option<StopReason> = None;

        'stream: loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return TurnOutcome::DeadlineExceeded;
            }
            let idle = self.engine.config.provider_idle_timeout.min(remaining);

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return TurnOutcome::Cancelled,
                next = tokio::time::timeout(idle, stream.next()) => match next {
                    Err(_) => {
                        return if remaining <= self.engine.config.provider_idle_timeout {
                            TurnOutcome::DeadlineExceeded
                        } else {
                            TurnOutcome::Stalled
                        };
                    }
                    Ok(None) => break 'stream,
                    Ok(Some(Err(LlmError::Stalled { .. }))) => return TurnOutcome::Stalled,
                    Ok(Some(Err(e))) => return TurnOutcome::ProviderFailed(e.to_string()),
                    Ok(Some(Ok(chunk))) => chunk,
                },
            };

            match chunk {
                StreamChunk::Token(text) => {
                    for event in parser.push(&text) {
                        apply_event(&mut parse, event);
                    }
                    if parse.fabricated {
                        // Hallucination defense: close the provider stream
                        // immediately; nothing after the fake result is read.
                        drop(stream);
                        break 'stream;
                    }
                }
                StreamChunk::Done { reason, usage } => {
                    parse.usage = usage;
                    stop = Some(reason);
                    break 'stream;
                }
            }
        }

        for event in parser.finish(stop) {
            apply_event(&mut parse, event);
        }
        parse.repairs = parser.repairs();
        parse.duration_ms = turn_started.elapsed().as_millis() as u64;
        TurnOutcome::Parsed(parse)
    }

    /// Look up the capability and resolve parameters for one parsed call.
    fn prepare_call(&self, call: &ParsedCall) -> PreparedCall {
        let capability = self
            .catalog
            .iter()
            .find(|entry| entry.server_id == call.server_id)
            .and_then(|entry| {
                entry
                    .capabilities
                    .iter()
                    .find(|cap| cap.action == call.action)
            })
            .cloned();

        let resolution = match &capability {
            None => {
                let known: Vec<&str> = self
                    .catalog
                    .iter()
                    .map(|entry| entry.server_id.as_str())
                    .collect();
                Err(error_record(
                    "invalid_params",
                    &format!(
                        "unknown tool server '{}'; available servers: {}",
                        call.server_id,
                        if known.is_empty() {
                            "(none)".to_string()
                        } else {
                            known.join(", ")
                        }
                    ),
                ))
            }
            Some(capability) => resolve_parameters(capability, &call.raw_params)
                .map_err(|reason| error_record("invalid_params", &reason)),
        };

        PreparedCall {
            call: call.clone(),
            capability,
            resolution,
        }
    }

    /// Dispatch the prepared calls (one, or two concurrently) and record
    /// their steps in source order.
    async fn dispatch_all(
        &mut self,
        parsed: &TurnParse,
        prepared: Vec<PreparedCall>,
    ) -> Result<Vec<String>, EngineResult> {
        let mut rendered = Vec::with_capacity(prepared.len());

        if prepared.len() <= 1 {
            for (index, item) in prepared.into_iter().enumerate() {
                let result = self
                    .record_and_dispatch(parsed, item, index == 0)
                    .await?;
                rendered.push(result);
            }
            return Ok(rendered);
        }

        // Parallel mode: both dispatches run concurrently with the same
        // deadline policy; results are joined in source position order.
        let mut futures = Vec::new();
        let mut metas = Vec::new();
        let base_step = self.next_step_id;
        for (index, item) in prepared.iter().enumerate() {
            let step_id = base_step + (index as u32) * 2;
            metas.push(item.clone());
            futures.push(self.dispatch_one(item.clone(), step_id));
        }
        let outcomes = futures::future::join_all(futures).await;

        for (index, (item, outcome)) in metas.into_iter().zip(outcomes).enumerate() {
            let call_step = Step::tool_call(
                self.next_step_id,
                item.call.server_id.clone(),
                item.call.action.clone(),
                item.resolution.clone().unwrap_or_else(|_| serde_json::Value::Null),
            );
            let call_step = if index == 0 {
                self.with_turn_usage(call_step, parsed)
            } else {
                call_step
            };
            self.record(call_step).await?;

            let rendered_result = self
                .record_dispatch_result(&item, outcome)
                .await?;
            rendered.push(rendered_result);
        }
        Ok(rendered)
    }

    /// Sequential path: record the call step, dispatch, record the result.
    async fn record_and_dispatch(
        &mut self,
        parsed: &TurnParse,
        item: PreparedCall,
        first: bool,
    ) -> Result<String, EngineResult> {
        let parameters = item
            .resolution
            .clone()
            .unwrap_or_else(|_| serde_json::Value::Null);
        let mut call_step = Step::tool_call(
            self.next_step_id,
            item.call.server_id.clone(),
            item.call.action.clone(),
            parameters,
        );
        if first {
            call_step = self.with_turn_usage(call_step, parsed);
        }
        let call_step_id = self.next_step_id;
        self.record(call_step).await?;

        let outcome = self.dispatch_one(item.clone(), call_step_id).await;
        self.record_dispatch_result(&item, outcome).await
    }

    /// Record the tool_result (or error) step for a dispatch outcome and
    /// return the text to inject.
    async fn record_dispatch_result(
        &mut self,
        item: &PreparedCall,
        outcome: DispatchOutcome,
    ) -> Result<String, EngineResult> {
        match outcome {
            DispatchOutcome::Done(invocation) => {
                let duration = (invocation.finished_at - invocation.started_at)
                    .num_milliseconds()
                    .max(0) as u64;
                let step = Step::tool_result(
                    self.next_step_id,
                    invocation.server_id.clone(),
                    invocation.action.clone(),
                    invocation.result.clone(),
                    invocation.status == InvocationStatus::Ok,
                )
                .with_duration_ms(duration);
                self.record(step).await?;
                Ok(invocation.result)
            }
            DispatchOutcome::Cancelled => {
                let step = Step::error_raw(
                    self.next_step_id,
                    "cancelled",
                    format!(
                        "tool call {}.{} aborted by cancellation",
                        item.call.server_id, item.call.action
                    ),
                );
                let _ = self.record(step).await;
                Err(self.finish(TrajectoryStatus::Cancelled, None, None).await)
            }
            DispatchOutcome::DeadlineExceeded => {
                let step = Step::error(
                    self.next_step_id,
                    ErrorKind::TaskTimeout,
                    format!(
                        "tool call {}.{} cut off by the task deadline",
                        item.call.server_id, item.call.action
                    ),
                );
                let _ = self.record(step).await;
                Err(self
                    .finish(TrajectoryStatus::Timeout, Some(ErrorKind::TaskTimeout), None)
                    .await)
            }
        }
    }

    /// Dispatch one call with the spec'd deadline and single-retry policy.
    /// Calls that failed resolution never reach the invoker.
    async fn dispatch_one(&self, item: PreparedCall, step_id: u32) -> DispatchOutcome {
        let parameters = match &item.resolution {
            Err(message) => {
                // Engine-side rejection surfaces as a failed invocation so
                // the model sees a descriptive tool result and can retry.
                return DispatchOutcome::Done(synthetic_invalid(
                    self.task.task_id,
                    step_id,
                    &item.call,
                    message.clone(),
                ));
            }
            Ok(parameters) => parameters.clone(),
        };

        let mut attempt = 1;
        loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return DispatchOutcome::DeadlineExceeded;
            }
            let per_call = remaining
                .min(self.engine.config.default_tool_timeout)
                .min(
                    item.capability
                        .as_ref()
                        .and_then(|c| c.timeout_seconds)
                        .map(Duration::from_secs)
                        .unwrap_or(Duration::MAX),
                );

            let request = InvokeRequest {
                task_id: self.task.task_id,
                step_id,
                server_id: item.call.server_id.clone(),
                action: item.call.action.clone(),
                parameters: parameters.clone(),
                deadline: per_call,
                attempt,
            };

            let invocation = tokio::select! {
                _ = self.cancel.cancelled() => return DispatchOutcome::Cancelled,
                invocation = self.engine.invoker.invoke(request) => invocation,
            };

            let retryable = matches!(
                invocation.status,
                InvocationStatus::Timeout | InvocationStatus::Unreachable
            );
            if retryable && attempt == 1 {
                attempt = 2;
                tracing::debug!(
                    task = %self.task.task_id,
                    server = %item.call.server_id,
                    "dispatch failed ({:?}); retrying once",
                    invocation.status
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return DispatchOutcome::Cancelled,
                    _ = tokio::time::sleep(DISPATCH_RETRY_BACKOFF) => {}
                }
                continue;
            }
            return DispatchOutcome::Done(invocation);
        }
    }

    fn with_turn_usage(&self, step: Step, parsed: &TurnParse) -> Step {
        step.with_usage(
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
            cost_micros(parsed.usage, self.engine.llm.as_ref()),
        )
        .with_duration_ms(parsed.duration_ms)
    }

    /// Record a step; on trajectory failure, abort the task.
    async fn record(&mut self, step: Step) -> Result<(), EngineResult> {
        match self.recorder.record_step(self.handle, &step).await {
            Ok(()) => {
                self.next_step_id = step.step_id + 1;
                self.steps.push(step);
                Ok(())
            }
            Err(e) => {
                tracing::error!(task = %self.task.task_id, "trajectory write failed: {e}");
                Err(EngineResult {
                    status: TrajectoryStatus::Failed,
                    error_kind: None,
                    final_answer: None,
                    steps: std::mem::take(&mut self.steps),
                })
            }
        }
    }

    async fn terminal_error(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        status: TrajectoryStatus,
    ) -> EngineResult {
        let step = Step::error(self.next_step_id, kind, message);
        let _ = self.record(step).await;
        self.finish(status, Some(kind), None).await
    }

    async fn terminal_cancelled(&mut self) -> EngineResult {
        self.finish(TrajectoryStatus::Cancelled, None, None).await
    }

    async fn finish(
        &mut self,
        status: TrajectoryStatus,
        error_kind: Option<ErrorKind>,
        final_answer: Option<String>,
    ) -> EngineResult {
        EngineResult {
            status,
            error_kind,
            final_answer,
            steps: std::mem::take(&mut self.steps),
        }
    }
}

/// A call paired with its capability lookup and parameter resolution.
#[derive(Debug, Clone)]
struct PreparedCall {
    call: ParsedCall,
    capability: Option<Capability>,
    resolution: Result<serde_json::Value, String>,
}

fn synthetic_invalid(
    task_id: uuid::Uuid,
    step_id: u32,
    call: &ParsedCall,
    message: String,
) -> Invocation {
    let now = chrono::Utc::now();
    Invocation {
        invocation_id: uuid::Uuid::new_v4(),
        task_id,
        step_id,
        server_id: call.server_id.clone(),
        action: call.action.clone(),
        parameters: serde_json::Value::Null,
        started_at: now,
        finished_at: now,
        status: InvocationStatus::InvalidParams,
        result: message,
        attempt: 1,
    }
}

fn apply_event(parse: &mut TurnParse, event: ResponseEvent) {
    match event {
        ResponseEvent::ThinkClose { text } => {
            if !text.trim().is_empty() {
                parse.thinks.push(text);
            }
        }
        ResponseEvent::AnswerClose { text } => {
            if parse.answer.is_none() {
                parse.answer = Some(text);
            }
        }
        ResponseEvent::ToolCallOpen { server_id } => {
            parse.calls.push(ParsedCall {
                server_id,
                action: String::new(),
                raw_params: String::new(),
            });
        }
        ResponseEvent::ActionOpen { action } => {
            if let Some(call) = parse.calls.last_mut() {
                call.action = action;
            }
        }
        ResponseEvent::ToolCallParams { raw } => {
            if let Some(call) = parse.calls.last_mut() {
                call.raw_params = raw;
            }
        }
        ResponseEvent::ParallelOpen => parse.parallel = true,
        ResponseEvent::FabricatedResult => parse.fabricated = true,
        ResponseEvent::ThinkOpen
        | ResponseEvent::AnswerOpen
        | ResponseEvent::ToolCallClose
        | ResponseEvent::ParallelClose
        | ResponseEvent::StreamEnd
        | ResponseEvent::StreamStopped { .. } => {}
    }
}

fn render_thinks(thinks: &[String]) -> String {
    thinks
        .iter()
        .map(|t| format!("<think>{t}</think>"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Canonical assistant-turn text for history: think blocks, then the tool
/// call block(s), then the terminator. The injected results are appended
/// after dispatch.
fn render_assistant_turn(thinks: &[String], calls: &[PreparedCall], parallel: bool) -> String {
    let mut out = render_thinks(thinks);
    if !out.is_empty() {
        out.push('\n');
    }

    let blocks: Vec<String> = calls
        .iter()
        .map(|item| {
            let params = match &item.resolution {
                Ok(value) => value.to_string(),
                Err(_) => item.call.raw_params.clone(),
            };
            format!(
                "<{server}><{action}>{params}</{action}></{server}>",
                server = item.call.server_id,
                action = item.call.action,
            )
        })
        .collect();

    if parallel && blocks.len() > 1 {
        out.push_str(&format!("<parallel>{}</parallel>", blocks.join("")));
    } else {
        out.push_str(&blocks.join("\n"));
    }
    out.push_str("\n<execute_tools/>");
    out
}
