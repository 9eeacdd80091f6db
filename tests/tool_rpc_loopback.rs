//! Tool RPC against real loopback servers.
//!
//! Stands up actual HTTP and WebSocket tool servers on 127.0.0.1, registers
//! them as externally managed endpoints, waits for the supervisor's
//! readiness probe, and drives invocations through the full routing path:
//! validation, admission, transport, deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;

use stride::config::OrchestratorConfig;
use stride::orchestrator::{
    Capability, InvocationStatus, InvokeRequest, Invoker, ParamType, ParameterSpec, ProjectType,
    ServerState, ToolRegistry,
};

fn orchestrator_config(dir: &std::path::Path) -> OrchestratorConfig {
    OrchestratorConfig {
        port_range: (18500, 18599),
        startup_timeout: Duration::from_secs(10),
        default_call_timeout: Duration::from_secs(5),
        max_in_flight_per_server: 4,
        server_dirs: vec![],
        snapshot_path: dir.join("snapshot.json"),
    }
}

fn echo_capability(timeout_seconds: Option<u64>) -> Capability {
    Capability {
        action: "echo".to_string(),
        description: "Echo the text back".to_string(),
        parameters: vec![ParameterSpec {
            name: "text".to_string(),
            param_type: ParamType::String,
            required: true,
            description: "text to echo".to_string(),
            default: None,
        }],
        examples: vec![],
        timeout_seconds,
    }
}

fn invoke_request(server_id: &str, action: &str, params: serde_json::Value) -> InvokeRequest {
    InvokeRequest {
        task_id: uuid::Uuid::now_v7(),
        step_id: 1,
        server_id: server_id.to_string(),
        action: action.to_string(),
        parameters: params,
        deadline: Duration::from_secs(5),
        attempt: 1,
    }
}

async fn wait_ready(registry: &Arc<ToolRegistry>, server_id: &str) {
    for _ in 0..100 {
        let servers = registry.servers().await;
        if servers
            .iter()
            .any(|s| s.server_id == server_id && s.state == ServerState::Ready)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server '{server_id}' never became ready");
}

async fn spawn_http_tool(slow: bool) -> SocketAddr {
    async fn health() -> impl IntoResponse {
        Json(json!({"status": "ok", "version": "1", "capabilities_digest": "d"}))
    }

    let call = move |Json(body): Json<serde_json::Value>| async move {
        if slow {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let text = body["arguments"]["text"].as_str().unwrap_or_default();
        Json(json!({"result": format!("echo: {text}")}))
    };

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

async fn handle_ws(mut socket: WebSocket) {
    // Unsolicited event first; callers must skip it.
    let _ = socket
        .send(Message::Text(
            json!({"event": "hello", "data": {}}).to_string().into(),
        ))
        .await;

    while let Some(Ok(Message::Text(text))) = socket.recv().await {
        let request: serde_json::Value = serde_json::from_str(&text).unwrap();
        let id = request["id"].as_str().unwrap_or_default().to_string();
        let response = match request["params"]["action"].as_str() {
            Some("echo") => {
                let text = request["params"]["arguments"]["text"]
                    .as_str()
                    .unwrap_or_default();
                json!({"id": id, "result": format!("ws-echo: {text}")})
            }
            _ => json!({"id": id, "error": {"code": -32601, "message": "unknown action"}}),
        };
        let _ = socket
            .send(Message::Text(response.to_string().into()))
            .await;
    }
}

async fn spawn_ws_tool() -> SocketAddr {
    let app = Router::new().route(
        "/",
        any(|upgrade: WebSocketUpgrade| async move { upgrade.on_upgrade(handle_ws) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn http_tool_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new(orchestrator_config(dir.path())));
    let addr = spawn_http_tool(false).await;

    registry
        .register_endpoint(
            "echoer",
            format!("http://{addr}"),
            ProjectType::Python,
            vec![echo_capability(None)],
        )
        .await
        .unwrap();
    wait_ready(&registry, "echoer").await;

    let invocation = registry
        .invoke(invoke_request("echoer", "echo", json!({"text": "hi"})))
        .await;
    assert_eq!(invocation.status, InvocationStatus::Ok);
    assert_eq!(invocation.result, "echo: hi");

    // The catalog now lists the ready server.
    let catalog = registry.catalog().await;
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].capabilities[0].action, "echo");
}

#[tokio::test]
async fn ws_tool_round_trip_skips_unsolicited_events() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new(orchestrator_config(dir.path())));
    let addr = spawn_ws_tool().await;

    registry
        .register_endpoint(
            "wsecho",
            format!("ws://{addr}"),
            ProjectType::Node,
            vec![echo_capability(None)],
        )
        .await
        .unwrap();
    wait_ready(&registry, "wsecho").await;

    let invocation = registry
        .invoke(invoke_request("wsecho", "echo", json!({"text": "one"})))
        .await;
    assert_eq!(invocation.status, InvocationStatus::Ok);
    assert_eq!(invocation.result, "ws-echo: one");

    // Second call reuses the pooled connection.
    let invocation = registry
        .invoke(invoke_request("wsecho", "echo", json!({"text": "two"})))
        .await;
    assert_eq!(invocation.status, InvocationStatus::Ok);
    assert_eq!(invocation.result, "ws-echo: two");
}

#[tokio::test]
async fn ws_tool_server_error_maps_to_tool_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new(orchestrator_config(dir.path())));
    let addr = spawn_ws_tool().await;

    // Declare an action the server will reject at call time, to exercise
    // the structured error path rather than local validation.
    let mut breaker = echo_capability(None);
    breaker.action = "break".to_string();
    breaker.parameters.clear();

    registry
        .register_endpoint(
            "wsbreak",
            format!("ws://{addr}"),
            ProjectType::Node,
            vec![breaker],
        )
        .await
        .unwrap();
    wait_ready(&registry, "wsbreak").await;

    let invocation = registry
        .invoke(invoke_request("wsbreak", "break", json!({})))
        .await;
    assert_eq!(invocation.status, InvocationStatus::ToolError);
    assert!(invocation.result.contains("unknown action"));
}

#[tokio::test]
async fn slow_tool_hits_capability_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new(orchestrator_config(dir.path())));
    let addr = spawn_http_tool(true).await;

    registry
        .register_endpoint(
            "sloth",
            format!("http://{addr}"),
            ProjectType::Python,
            vec![echo_capability(Some(1))],
        )
        .await
        .unwrap();
    wait_ready(&registry, "sloth").await;

    let started = std::time::Instant::now();
    let invocation = registry
        .invoke(invoke_request("sloth", "echo", json!({"text": "zzz"})))
        .await;
    assert_eq!(invocation.status, InvocationStatus::Timeout);
    // Bounded by the 1s capability override, not the 5s default.
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(invocation.result.contains("timeout"));
}

#[tokio::test]
async fn validation_fills_defaults_before_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new(orchestrator_config(dir.path())));
    let addr = spawn_http_tool(false).await;

    let mut capability = echo_capability(None);
    capability.parameters.push(ParameterSpec {
        name: "mode".to_string(),
        param_type: ParamType::String,
        required: false,
        description: String::new(),
        default: Some(json!("plain")),
    });

    registry
        .register_endpoint(
            "echoer",
            format!("http://{addr}"),
            ProjectType::Python,
            vec![capability],
        )
        .await
        .unwrap();
    wait_ready(&registry, "echoer").await;

    let invocation = registry
        .invoke(invoke_request("echoer", "echo", json!({"text": "x"})))
        .await;
    assert_eq!(invocation.status, InvocationStatus::Ok);
    assert_eq!(invocation.parameters["mode"], json!("plain"));
}
