//! Whole-pipeline test: submission → queue → worker → streaming provider →
//! reasoning loop → tool RPC → trajectory on disk.
//!
//! The LLM is a real loopback HTTP server speaking the streaming chat
//! completions wire format, scripted for two turns: a tool call, then the
//! final answer. The tool is a real loopback HTTP server. Everything in
//! between is the production wiring.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use stride::config::{Config, DispatchConfig, LlmConfig, OrchestratorConfig, SessionConfig};
use stride::orchestrator::{Capability, ParamType, ParameterSpec, ProjectType, ServerState};
use stride::platform::Platform;
use stride::task::{Task, TaskState, TaskType};
use stride::trajectory::{Grouping, TrajectoryRecord};

/// Render a streamed chat completion: token chunks, a usage chunk, [DONE].
fn sse_completion(tokens: &[&str], input_tokens: u64, output_tokens: u64) -> String {
    let mut body = String::new();
    for token in tokens {
        let chunk = json!({
            "choices": [{"delta": {"content": token}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    let finish = json!({
        "choices": [{"delta": {}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": input_tokens, "completion_tokens": output_tokens}
    });
    body.push_str(&format!("data: {finish}\n\n"));
    body.push_str("data: [DONE]\n\n");
    body
}

/// Scripted model: turn 1 calls the sandbox, turn 2 answers.
async fn chat_completions(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    let turn = calls.fetch_add(1, Ordering::SeqCst);
    let body = if turn == 0 {
        sse_completion(
            &[
                "<think>I should run this in the sandbox.</think>",
                "<microsandbox><microsandbox_execute>",
                "{\"code\":\"print(2**10)\"}",
                "</microsandbox_execute></microsandbox>",
                "<execute_tools/>",
            ],
            220,
            48,
        )
    } else {
        sse_completion(&["<answer>1024"], 300, 6)
    };
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn spawn_fake_llm() -> SocketAddr {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(Arc::new(AtomicUsize::new(0)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_fake_tool() -> SocketAddr {
    async fn health() -> impl IntoResponse {
        Json(json!({"status": "ok", "version": "1", "capabilities_digest": "x"}))
    }
    async fn call(Json(body): Json<serde_json::Value>) -> impl IntoResponse {
        assert_eq!(body["action"], "microsandbox_execute");
        Json(json!({"result": "1024"}))
    }
    let app = Router::new()
        .route("/health", get(health))
        .route("/call", post(call));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_config(llm_addr: SocketAddr, dir: &std::path::Path) -> Config {
    let mut pool_sizes = HashMap::new();
    pool_sizes.insert(TaskType::Code, 1);

    Config {
        llm: LlmConfig {
            provider: "openai_compatible".to_string(),
            base_url: format!("http://{llm_addr}"),
            model: "scripted-model".to_string(),
            api_key: None,
            idle_timeout: Duration::from_secs(10),
        },
        orchestrator: OrchestratorConfig {
            port_range: (18600, 18650),
            startup_timeout: Duration::from_secs(10),
            default_call_timeout: Duration::from_secs(10),
            max_in_flight_per_server: 4,
            server_dirs: vec![],
            snapshot_path: dir.join("snapshot.json"),
        },
        session: SessionConfig {
            endpoint: "memory:".to_string(),
            cache_size: 16,
            retention: Duration::from_secs(86_400),
            summarize_threshold: 20,
            summarize_keep_recent: 10,
        },
        dispatch: DispatchConfig {
            endpoint: "memory:".to_string(),
            pool_sizes,
            memory_budget_bytes: None,
        },
        trajectory_dir: dir.join("trajectories"),
        trajectory_grouping: Grouping::Daily,
        step_cap_default: 25,
        shutdown_grace: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn tool_call_task_runs_end_to_end() {
    let llm_addr = spawn_fake_llm().await;
    let tool_addr = spawn_fake_tool().await;
    let dir = tempfile::tempdir().unwrap();

    let platform = Platform::start(test_config(llm_addr, dir.path()))
        .await
        .unwrap();

    platform
        .registry
        .register_endpoint(
            "microsandbox",
            format!("http://{tool_addr}"),
            ProjectType::Python,
            vec![Capability {
                action: "microsandbox_execute".to_string(),
                description: "Run Python code".to_string(),
                parameters: vec![ParameterSpec {
                    name: "code".to_string(),
                    param_type: ParamType::String,
                    required: true,
                    description: "source".to_string(),
                    default: None,
                }],
                examples: vec![],
                timeout_seconds: None,
            }],
        )
        .await
        .unwrap();

    // Wait for the readiness probe before handing the model a catalog.
    for _ in 0..100 {
        let ready = platform
            .registry
            .servers()
            .await
            .iter()
            .any(|s| s.state == ServerState::Ready);
        if ready {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let task = Task::new("Compute 2^10 using code.", TaskType::Code).with_max_steps(10);
    let task_id = platform.dispatcher.submit(task).await.unwrap();

    let mut terminal = None;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(status) = platform.dispatcher.status(task_id).await.unwrap()
            && status.state.is_terminal()
        {
            terminal = Some(status);
            break;
        }
    }
    let terminal = terminal.expect("task never finished");
    assert_eq!(terminal.state, TaskState::Succeeded);
    assert_eq!(terminal.message.as_deref(), Some("1024"));

    // The trajectory file exists, ends with exactly one outcome, and its
    // totals equal the sum of the step records.
    let path = platform.recorder.find(task_id).await.expect("trajectory file");
    let records = platform.recorder.read(&path).await.unwrap();

    let outcomes: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            TrajectoryRecord::Outcome(outcome) => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes.len(), 1);
    let outcome = outcomes[0];
    assert_eq!(outcome.task_id, task_id);
    assert_eq!(outcome.final_answer.as_deref(), Some("1024"));

    let steps: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            TrajectoryRecord::Step(step) => Some(step.clone()),
            _ => None,
        })
        .collect();

    // think, tool_call, tool_result, answer, with gap-free ids from 1.
    assert_eq!(steps.len(), 4);
    for (index, step) in steps.iter().enumerate() {
        assert_eq!(step.step_id, (index + 1) as u32);
    }
    use stride::task::StepKind;
    assert_eq!(steps[0].kind, StepKind::Think);
    assert_eq!(steps[1].kind, StepKind::ToolCall);
    assert_eq!(steps[2].kind, StepKind::ToolResult);
    assert_eq!(steps[2].output, "1024");
    assert!(steps[2].success);
    assert_eq!(steps[3].kind, StepKind::Answer);

    // Every tool_call is immediately followed by its result.
    for window in steps.windows(2) {
        if window[0].kind == StepKind::ToolCall {
            assert!(matches!(
                window[1].kind,
                StepKind::ToolResult | StepKind::Error
            ));
            assert_eq!(window[1].step_id, window[0].step_id + 1);
        }
    }

    // Token totals are exact sums of the step accounting.
    let tokens_in: u64 = steps.iter().map(|s| s.tokens_in).sum();
    let tokens_out: u64 = steps.iter().map(|s| s.tokens_out).sum();
    assert_eq!(outcome.total_tokens_in, tokens_in);
    assert_eq!(outcome.total_tokens_out, tokens_out);
    assert_eq!(tokens_in, 520);
    assert_eq!(tokens_out, 54);

    platform.shutdown().await;
}

#[tokio::test]
async fn single_shot_answer_without_tools() {
    // A model that answers immediately; no tool servers registered at all.
    async fn chat(State(_): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        let body = sse_completion(
            &["<think>arithmetic</think>", "<answer>4"],
            80,
            8,
        );
        ([(header::CONTENT_TYPE, "text/event-stream")], body)
    }

    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .with_state(Arc::new(AtomicUsize::new(0)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let llm_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(llm_addr, dir.path());
    config.dispatch.pool_sizes.insert(TaskType::General, 1);

    let platform = Platform::start(config).await.unwrap();
    let task = Task::new("What is 2+2?", TaskType::General).with_max_steps(5);
    let task_id = platform.dispatcher.submit(task).await.unwrap();

    let mut terminal = None;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(status) = platform.dispatcher.status(task_id).await.unwrap()
            && status.state.is_terminal()
        {
            terminal = Some(status);
            break;
        }
    }
    let terminal = terminal.expect("task never finished");
    assert_eq!(terminal.state, TaskState::Succeeded);
    assert_eq!(terminal.message.as_deref(), Some("4"));

    platform.shutdown().await;
}
