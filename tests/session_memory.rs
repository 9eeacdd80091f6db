//! Cross-task memory through sessions.
//!
//! Two tasks share a session: the second task's prompt must carry a
//! summarized preamble of the first task's steps, and the session's step
//! list must be the concatenation of both trajectories in completion
//! order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stride::config::SessionConfig;
use stride::dispatch::{
    InMemoryQueue, InMemoryStatusStore, StatusStore, TaskQueue, WorkerContext, WorkerPool,
};
use stride::engine::{EngineConfig, ReasoningEngine};
use stride::error::LlmError;
use stride::llm::{
    ChatMessage, CompletionRequest, CompletionStream, LlmProvider, StopReason, StreamChunk, Usage,
};
use stride::orchestrator::{CatalogEntry, Invocation, InvocationStatus, InvokeRequest, Invoker};
use stride::session::SessionStore;
use stride::task::{StepKind, Task, TaskType};
use stride::trajectory::{Grouping, TrajectoryRecorder};

/// Provider that records every request and answers with a scripted list.
struct CapturingProvider {
    answers: Mutex<Vec<&'static str>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl CapturingProvider {
    fn new(answers: Vec<&'static str>) -> Self {
        Self {
            answers: Mutex::new(answers),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_messages(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for CapturingProvider {
    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, LlmError> {
        self.requests.lock().unwrap().push(req.messages.clone());
        let answer = {
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                "fallback"
            } else {
                answers.remove(0)
            }
        };
        let chunks = vec![
            Ok(StreamChunk::Token(format!("<answer>{answer}"))),
            Ok(StreamChunk::Done {
                reason: StopReason::StopSequence,
                usage: Usage {
                    input_tokens: 50,
                    output_tokens: 5,
                },
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        "capturing"
    }

    fn cost_per_token(&self) -> (rust_decimal::Decimal, rust_decimal::Decimal) {
        (rust_decimal::Decimal::ZERO, rust_decimal::Decimal::ZERO)
    }
}

struct NoToolInvoker;

#[async_trait::async_trait]
impl Invoker for NoToolInvoker {
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
            result: "no tools".to_string(),
            attempt: req.attempt,
        }
    }

    async fn catalog(&self) -> Vec<CatalogEntry> {
        vec![]
    }
}

async fn wait_terminal(status: &InMemoryStatusStore, task_id: uuid::Uuid) {
    for _ in 0..200 {
        if let Some(current) = status.get(task_id).await.unwrap()
            && current.state.is_terminal()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task never finished");
}

#[tokio::test]
async fn second_task_sees_first_tasks_history() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(CapturingProvider::new(vec!["the capital is Paris", "still Paris"]));
    let queue = Arc::new(InMemoryQueue::new());
    let status = Arc::new(InMemoryStatusStore::default());
    let sessions = Arc::new(
        SessionStore::from_config(SessionConfig {
            endpoint: "memory:".to_string(),
            cache_size: 16,
            retention: Duration::from_secs(86_400),
            summarize_threshold: 20,
            summarize_keep_recent: 10,
        })
        .unwrap(),
    );

    let ctx = WorkerContext {
        queue: queue.clone(),
        status: status.clone(),
        engine: Arc::new(ReasoningEngine::new(
            provider.clone(),
            Arc::new(NoToolInvoker),
            EngineConfig::default(),
        )),
        sessions: sessions.clone(),
        recorder: Arc::new(TrajectoryRecorder::new(dir.path(), Grouping::None)),
        memory_budget_bytes: None,
    };
    let mut sizes = HashMap::new();
    sizes.insert(TaskType::General, 1);
    let pool = WorkerPool::spawn(&sizes, ctx);

    // First task populates the session.
    let first = Task::new("What is the capital of France?", TaskType::General)
        .with_session("geo");
    let first_id = first.task_id;
    queue.submit(&first).await.unwrap();
    wait_terminal(&status, first_id).await;

    // Second task in the same session.
    let second = Task::new("And what did I just ask about?", TaskType::General)
        .with_session("geo");
    let second_id = second.task_id;
    queue.submit(&second).await.unwrap();
    wait_terminal(&status, second_id).await;

    // The session holds both tasks' steps, in completion order.
    let session = sessions.load_session("geo").await.unwrap();
    let answers: Vec<&str> = session
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::Answer)
        .map(|s| s.output.as_str())
        .collect();
    assert_eq!(answers, vec!["the capital is Paris", "still Paris"]);

    // The second request carried a session preamble with the first answer;
    // the first request carried none.
    let requests = provider.request_messages();
    assert_eq!(requests.len(), 2);
    let first_prompt = requests[0]
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(!first_prompt.contains("Context from earlier tasks"));

    let second_prompt = requests[1]
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(second_prompt.contains("Context from earlier tasks"));
    assert!(second_prompt.contains("the capital is Paris"));
    // The task description itself is the last message, verbatim.
    assert_eq!(
        requests[1].last().unwrap().content,
        "And what did I just ask about?"
    );

    pool.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn summarize_leaves_step_list_intact() {
    let sessions = SessionStore::from_config(SessionConfig {
        endpoint: "memory:".to_string(),
        cache_size: 16,
        retention: Duration::from_secs(86_400),
        summarize_threshold: 4,
        summarize_keep_recent: 2,
    })
    .unwrap();

    for i in 1..=9u32 {
        sessions
            .append_step("s", &stride::task::Step::think(i, format!("note {i}")))
            .await
            .unwrap();
    }

    let summary = sessions.summarize("s", 100_000).await.unwrap();
    assert!(summary.contains("Earlier in this session"));
    assert!(summary.contains("note 9"));

    // The digest is additive; the step sequence itself is untouched.
    let session = sessions.load_session("s").await.unwrap();
    assert_eq!(session.steps.len(), 9);
    for (index, step) in session.steps.iter().enumerate() {
        assert_eq!(step.output, format!("note {}", index + 1));
    }
}
