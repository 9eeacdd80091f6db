//! Worker pool: the consumers of the task streams.
//!
//! One long-lived worker task per pool slot, bound to one task type. A
//! worker claims an entry, writes a `running` status with a 10s heartbeat,
//! drives the reasoning engine, persists the trajectory and session
//! append, writes the terminal status, and only then acks the entry, so
//! re-delivery after a crash is therefore always safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::queue::{Lease, StatusStore, TaskQueue};
use crate::engine::ReasoningEngine;
use crate::error::SessionError;
use crate::session::SessionStore;
use crate::task::{ErrorKind, Task, TaskState, TaskStatus, TaskType, TrajectoryStatus};
use crate::trajectory::TrajectoryRecorder;

/// Heartbeat write interval for running tasks.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A running status with a heartbeat older than this is considered
/// abandoned and may be resumed by another worker.
const HEARTBEAT_STALE: Duration = Duration::from_secs(30);
/// Delivery attempts before a task fails with `redelivery_exhausted`.
const MAX_ATTEMPTS: u32 = 3;
/// Token budget for the session preamble prepended to the prompt.
const PREAMBLE_BUDGET_TOKENS: usize = 1024;
/// How long one claim call blocks before the loop re-checks shutdown.
const CLAIM_WAIT: Duration = Duration::from_secs(1);

/// Everything a worker needs to execute tasks.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn TaskQueue>,
    pub status: Arc<dyn StatusStore>,
    pub engine: Arc<ReasoningEngine>,
    pub sessions: Arc<SessionStore>,
    pub recorder: Arc<TrajectoryRecorder>,
    /// Soft process memory budget; claiming pauses above it.
    pub memory_budget_bytes: Option<u64>,
}

/// A running pool of workers across all task types.
pub struct WorkerPool {
    stop: CancellationToken,
    hard_cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `pool_sizes[t]` workers per task type.
    pub fn spawn(
        pool_sizes: &std::collections::HashMap<TaskType, usize>,
        ctx: WorkerContext,
    ) -> Self {
        let stop = CancellationToken::new();
        let hard_cancel = CancellationToken::new();
        let mut handles = Vec::new();

        for task_type in TaskType::ALL {
            let size = pool_sizes.get(&task_type).copied().unwrap_or(0);
            for slot in 0..size {
                let worker = Worker {
                    task_type,
                    slot,
                    ctx: ctx.clone(),
                    stop: stop.clone(),
                    hard_cancel: hard_cancel.clone(),
                };
                handles.push(tokio::spawn(worker.run()));
            }
        }

        Self {
            stop,
            hard_cancel,
            handles,
        }
    }

    /// Graceful shutdown: stop claiming, drain in-flight tasks up to
    /// `grace`, then cancel whatever is left.
    pub async fn shutdown(self, grace: Duration) {
        self.stop.cancel();
        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("shutdown grace expired; cancelling in-flight tasks");
            self.hard_cancel.cancel();
            // Workers observe the cancel at their next suspension point and
            // finalize with a cancelled outcome.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

struct Worker {
    task_type: TaskType,
    slot: usize,
    ctx: WorkerContext,
    stop: CancellationToken,
    hard_cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(task_type = %self.task_type, slot = self.slot, "worker started");
        let mut claim_backoff = Duration::from_millis(100);

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            // Soft backpressure: over the memory budget, stop claiming but
            // keep the stream intact. No load-shedding here.
            if let Some(budget) = self.ctx.memory_budget_bytes
                && process_rss_bytes().map(|rss| rss > budget).unwrap_or(false)
            {
                tracing::warn!(task_type = %self.task_type, "over memory budget; pausing claims");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let lease = tokio::select! {
                _ = self.stop.cancelled() => break,
                lease = self.ctx.queue.claim(self.task_type, CLAIM_WAIT) => lease,
            };

            match lease {
                Ok(Some(lease)) => {
                    claim_backoff = Duration::from_millis(100);
                    self.process(lease).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        task_type = %self.task_type,
                        "queue claim failed, backing off {claim_backoff:?}: {e}"
                    );
                    tokio::time::sleep(claim_backoff).await;
                    claim_backoff = (claim_backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        tracing::debug!(task_type = %self.task_type, slot = self.slot, "worker stopped");
    }

    async fn process(&self, lease: Lease) {
        let task = &lease.task;

        // Re-delivery detection via the status record.
        let existing = match self.ctx.status.get(task.task_id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(task = %task.task_id, "status read failed: {e}");
                None
            }
        };

        let attempt = match &existing {
            Some(status) if status.state.is_terminal() => {
                // Already finished by a previous delivery; ack and move on.
                let _ = self.ctx.queue.ack(self.task_type, lease.entry_id).await;
                return;
            }
            Some(status) if status.state == TaskState::Running => {
                if !status.heartbeat_stale(HEARTBEAT_STALE) {
                    // Another worker is alive and on it; leave the entry
                    // parked under its new visibility timeout.
                    tracing::debug!(task = %task.task_id, "delivery raced a live worker; skipping");
                    return;
                }
                status.attempt + 1
            }
            _ => lease.delivery,
        };

        if attempt > MAX_ATTEMPTS {
            tracing::error!(task = %task.task_id, attempt, "re-delivery budget exhausted");
            self.finalize_without_execution(
                task,
                attempt,
                ErrorKind::RedeliveryExhausted,
                format!("task re-delivered {attempt} times"),
            )
            .await;
            let _ = self.ctx.queue.ack(self.task_type, lease.entry_id).await;
            return;
        }

        self.put_status_retrying(TaskStatus::running(task.task_id, attempt))
            .await;
        let heartbeat = self.spawn_heartbeat(task.task_id);

        // Session history: single writer per session; a lock timeout means
        // we proceed history-less and say so.
        let mut session_guard = None;
        let mut preamble = None;
        if let Some(session_id) = &task.session_id {
            match self.ctx.sessions.lock_session(session_id).await {
                Ok(guard) => {
                    session_guard = Some(guard);
                    match self
                        .ctx
                        .sessions
                        .summarize(session_id, PREAMBLE_BUDGET_TOKENS)
                        .await
                    {
                        Ok(summary) if !summary.trim().is_empty() => preamble = Some(summary),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(session = %session_id, "summarize failed: {e}");
                        }
                    }
                }
                Err(SessionError::LockTimeout { .. }) => {
                    tracing::warn!(
                        session = %session_id,
                        task = %task.task_id,
                        "{}: proceeding without history",
                        ErrorKind::SessionConflict
                    );
                }
                Err(e) => {
                    tracing::warn!(session = %session_id, "session lock failed: {e}");
                }
            }
        }

        let mut handle = match self.ctx.recorder.begin_task(task, attempt).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(task = %task.task_id, "cannot open trajectory: {e}");
                heartbeat.abort();
                self.finalize_status(
                    task,
                    attempt,
                    TaskState::Failed,
                    None,
                    Some(e.to_string()),
                    0,
                )
                .await;
                let _ = self.ctx.queue.ack(self.task_type, lease.entry_id).await;
                return;
            }
        };

        let result = self
            .ctx
            .engine
            .run_task(
                task,
                preamble,
                &self.ctx.recorder,
                &mut handle,
                self.hard_cancel.child_token(),
            )
            .await;

        let last_step_id = handle.last_step_id();
        let outcome = self
            .ctx
            .recorder
            .finalize(
                handle,
                result.status,
                result.error_kind,
                result.final_answer.clone(),
            )
            .await;
        if let Err(e) = outcome {
            tracing::error!(task = %task.task_id, "trajectory finalize failed: {e}");
        }

        // Session append happens after the trajectory is durable, in task
        // completion order.
        if let Some(session_id) = &task.session_id {
            for step in &result.steps {
                if let Err(e) = self.ctx.sessions.append_step(session_id, step).await {
                    tracing::warn!(session = %session_id, "session append failed: {e}");
                    break;
                }
            }
        }
        drop(session_guard);

        heartbeat.abort();
        self.finalize_status(
            task,
            attempt,
            result.status.into(),
            result.error_kind,
            result.final_answer,
            last_step_id,
        )
        .await;

        // Trajectory and status are durable; the entry can go.
        let _ = self.ctx.queue.ack(self.task_type, lease.entry_id).await;
        tracing::info!(
            task = %task.task_id,
            status = ?result.status,
            steps = result.steps.len(),
            "task finished"
        );
    }

    /// Terminal bookkeeping for a task that never ran (re-delivery cap).
    async fn finalize_without_execution(
        &self,
        task: &Task,
        attempt: u32,
        kind: ErrorKind,
        message: String,
    ) {
        // The trajectory still gets an outcome record: no task disappears
        // without one.
        match self.ctx.recorder.begin_task(task, attempt).await {
            Ok(handle) => {
                if let Err(e) = self
                    .ctx
                    .recorder
                    .finalize(handle, TrajectoryStatus::Failed, Some(kind), None)
                    .await
                {
                    tracing::error!(task = %task.task_id, "finalize failed: {e}");
                }
            }
            Err(e) => tracing::error!(task = %task.task_id, "cannot open trajectory: {e}"),
        }
        self.finalize_status(task, attempt, TaskState::Failed, Some(kind), Some(message), 0)
            .await;
    }

    async fn finalize_status(
        &self,
        task: &Task,
        attempt: u32,
        state: TaskState,
        error_kind: Option<ErrorKind>,
        message: Option<String>,
        last_step_id: u32,
    ) {
        let status = TaskStatus {
            task_id: task.task_id,
            state,
            last_step_id,
            attempt,
            error_kind,
            message,
            heartbeat_at: None,
            updated_at: chrono::Utc::now(),
        };
        self.put_status_retrying(status).await;
    }

    /// Status writes are retried; after a few inline attempts the retry
    /// moves to the background so execution is never blocked on the KV
    /// store.
    async fn put_status_retrying(&self, status: TaskStatus) {
        let mut backoff = Duration::from_millis(100);
        for _ in 0..5 {
            match self.ctx.status.put(&status).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(task = %status.task_id, "status write failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }

        let store = self.ctx.status.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if store.put(&status).await.is_ok() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        });
    }

    fn spawn_heartbeat(&self, task_id: uuid::Uuid) -> JoinHandle<()> {
        let store = self.ctx.status.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat(task_id).await {
                    tracing::warn!(task = %task_id, "heartbeat write failed: {e}");
                }
            }
        })
    }
}

/// Resident set size of this process, if the platform exposes it.
fn process_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::dispatch::queue::{InMemoryQueue, InMemoryStatusStore};
    use crate::engine::EngineConfig;
    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionStream, LlmProvider, StopReason, StreamChunk, Usage};
    use crate::orchestrator::{CatalogEntry, Invocation, InvocationStatus, InvokeRequest, Invoker};
    use crate::trajectory::Grouping;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    /// Provider that always answers immediately.
    struct AnswerProvider;

    #[async_trait::async_trait]
    impl LlmProvider for AnswerProvider {
        async fn stream(&self, _req: CompletionRequest) -> Result<CompletionStream, LlmError> {
            let chunks = vec![
                Ok(StreamChunk::Token("<answer>done".to_string())),
                Ok(StreamChunk::Done {
                    reason: StopReason::StopSequence,
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 3,
                    },
                }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn model_name(&self) -> &str {
            "answerer"
        }

        fn cost_per_token(&self) -> (rust_decimal::Decimal, rust_decimal::Decimal) {
            (dec!(0), dec!(0))
        }
    }

    struct NullInvoker;

    #[async_trait::async_trait]
    impl Invoker for NullInvoker {
        async fn invoke(&self, req: InvokeRequest) -> Invocation {
            let now = chrono::Utc::now();
            Invocation {
                invocation_id: uuid::Uuid::new_v4(),
                task_id: req.task_id,
                step_id: req.step_id,
                server_id: req.server_id,
                action: req.action,
                parameters: req.parameters,
                started_at: now,
                finished_at: now,
                status: InvocationStatus::Unreachable,
                result: "no servers".to_string(),
                attempt: req.attempt,
            }
        }

        async fn catalog(&self) -> Vec<CatalogEntry> {
            vec![]
        }
    }

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        status: Arc<InMemoryStatusStore>,
        pool: WorkerPool,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        let status = Arc::new(InMemoryStatusStore::default());
        let engine = Arc::new(ReasoningEngine::new(
            Arc::new(AnswerProvider),
            Arc::new(NullInvoker),
            EngineConfig::default(),
        ));
        let sessions = Arc::new(
            SessionStore::from_config(SessionConfig {
                endpoint: "memory:".to_string(),
                cache_size: 8,
                retention: Duration::from_secs(86_400),
                summarize_threshold: 20,
                summarize_keep_recent: 10,
            })
            .unwrap(),
        );
        let recorder = Arc::new(TrajectoryRecorder::new(dir.path(), Grouping::None));

        let ctx = WorkerContext {
            queue: queue.clone(),
            status: status.clone(),
            engine,
            sessions,
            recorder,
            memory_budget_bytes: None,
        };
        let mut sizes = HashMap::new();
        sizes.insert(TaskType::General, 1);
        let pool = WorkerPool::spawn(&sizes, ctx);

        Fixture {
            queue,
            status,
            pool,
            _dir: dir,
        }
    }

    async fn wait_terminal(
        status: &InMemoryStatusStore,
        task_id: uuid::Uuid,
    ) -> TaskStatus {
        for _ in 0..200 {
            if let Some(current) = status.get(task_id).await.unwrap()
                && current.state.is_terminal()
            {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn test_pool_runs_task_to_success_and_acks() {
        let fixture = fixture();
        let task = Task::new("what is 2+2", TaskType::General);
        let task_id = task.task_id;
        fixture.queue.submit(&task).await.unwrap();

        let terminal = wait_terminal(&fixture.status, task_id).await;
        assert_eq!(terminal.state, TaskState::Succeeded);
        assert_eq!(terminal.message.as_deref(), Some("done"));

        // Acked: the stream is empty.
        for _ in 0..100 {
            if fixture.queue.depth(TaskType::General).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fixture.queue.depth(TaskType::General).await.unwrap(), 0);

        fixture.pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_terminal_status_means_ack_without_reexecution() {
        let fixture = fixture();
        let task = Task::new("already done", TaskType::General);

        // A previous delivery finished this task.
        let mut done = TaskStatus::running(task.task_id, 1);
        done.state = TaskState::Succeeded;
        fixture.status.put(&done).await.unwrap();

        fixture.queue.submit(&task).await.unwrap();
        for _ in 0..200 {
            if fixture.queue.depth(TaskType::General).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fixture.queue.depth(TaskType::General).await.unwrap(), 0);

        // Status unchanged: still the original terminal record.
        let status = fixture.status.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.attempt, 1);

        fixture.pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stale_running_resumes_with_bumped_attempt() {
        let fixture = fixture();
        let task = Task::new("resume me", TaskType::General);

        let mut stale = TaskStatus::running(task.task_id, 1);
        stale.heartbeat_at = Some(chrono::Utc::now() - chrono::Duration::seconds(300));
        fixture.status.put(&stale).await.unwrap();

        fixture.queue.submit(&task).await.unwrap();
        let terminal = wait_terminal(&fixture.status, task.task_id).await;
        assert_eq!(terminal.state, TaskState::Succeeded);
        assert_eq!(terminal.attempt, 2);

        fixture.pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_redelivery_exhaustion() {
        let fixture = fixture();
        let task = Task::new("cursed", TaskType::General);

        let mut stale = TaskStatus::running(task.task_id, MAX_ATTEMPTS);
        stale.heartbeat_at = Some(chrono::Utc::now() - chrono::Duration::seconds(300));
        fixture.status.put(&stale).await.unwrap();

        fixture.queue.submit(&task).await.unwrap();
        let terminal = wait_terminal(&fixture.status, task.task_id).await;
        assert_eq!(terminal.state, TaskState::Failed);
        assert_eq!(terminal.error_kind, Some(ErrorKind::RedeliveryExhausted));

        fixture.pool.shutdown(Duration::from_secs(5)).await;
    }
}
