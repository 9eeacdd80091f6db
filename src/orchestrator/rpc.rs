//! Tool RPC transports.
//!
//! Two wire formats, selected by the server's endpoint scheme:
//!
//! - WebSocket, persistent connection. Request `{id, method: "call",
//!   params: {action, arguments}}`; response `{id, result}` or `{id,
//!   error: {code, message, data?}}`. Unsolicited `event` messages are
//!   ignored.
//! - HTTP. `POST /call` with `{action, arguments}`; `{result}` on success
//!   or an error body on 4xx/5xx.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use crate::error::ToolError;

/// A pooled WebSocket connection to one server.
pub type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection pool slot; one persistent connection per server, reused
/// across calls and dropped on any transport error.
pub type WsPool = Mutex<Option<WsConnection>>;

#[derive(Debug, Serialize)]
struct WsRequest<'a> {
    id: String,
    method: &'static str,
    params: WsCallParams<'a>,
}

#[derive(Debug, Serialize)]
struct WsCallParams<'a> {
    action: &'a str,
    arguments: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct HttpCallBody<'a> {
    action: &'a str,
    arguments: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HttpCallResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

/// Render a result payload for injection: bare strings stay bare, anything
/// structured is serialized.
fn render_payload(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Call a capability over whichever transport the endpoint speaks, bounded
/// by `deadline`. On timeout the in-flight connection state is discarded so
/// a late response cannot be mistaken for the next call's.
pub async fn call_tool(
    http: &reqwest::Client,
    ws_pool: &WsPool,
    endpoint: &str,
    server_id: &str,
    action: &str,
    arguments: &serde_json::Value,
    deadline: Duration,
) -> Result<String, ToolError> {
    let is_ws = endpoint.starts_with("ws://") || endpoint.starts_with("wss://");

    let call = async {
        if is_ws {
            ws_call(ws_pool, endpoint, server_id, action, arguments).await
        } else {
            http_call(http, endpoint, server_id, action, arguments).await
        }
    };

    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            if is_ws {
                // The request may still be in flight on the wire; poison the
                // pooled connection rather than receive its answer later.
                *ws_pool.lock().await = None;
            }
            Err(ToolError::Timeout {
                server_id: server_id.to_string(),
                action: action.to_string(),
                deadline,
            })
        }
    }
}

async fn ws_call(
    pool: &WsPool,
    endpoint: &str,
    server_id: &str,
    action: &str,
    arguments: &serde_json::Value,
) -> Result<String, ToolError> {
    let mut slot = pool.lock().await;

    if slot.is_none() {
        let (stream, _response) =
            connect_async(endpoint)
                .await
                .map_err(|e| ToolError::Unreachable {
                    server_id: server_id.to_string(),
                    reason: e.to_string(),
                })?;
        *slot = Some(stream);
    }

    let Some(conn) = slot.as_mut() else {
        return Err(ToolError::Unreachable {
            server_id: server_id.to_string(),
            reason: "connection pool empty after connect".to_string(),
        });
    };

    let request_id = Uuid::new_v4().to_string();
    let request = WsRequest {
        id: request_id.clone(),
        method: "call",
        params: WsCallParams { action, arguments },
    };
    let body = serde_json::to_string(&request).map_err(|e| ToolError::Unreachable {
        server_id: server_id.to_string(),
        reason: format!("request serialization failed: {e}"),
    })?;

    if let Err(e) = conn.send(Message::Text(body.into())).await {
        *slot = None;
        return Err(ToolError::Unreachable {
            server_id: server_id.to_string(),
            reason: e.to_string(),
        });
    }

    loop {
        let message = match conn.next().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                *slot = None;
                return Err(ToolError::Unreachable {
                    server_id: server_id.to_string(),
                    reason: e.to_string(),
                });
            }
            None => {
                *slot = None;
                return Err(ToolError::Unreachable {
                    server_id: server_id.to_string(),
                    reason: "connection closed mid-call".to_string(),
                });
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                *slot = None;
                return Err(ToolError::Unreachable {
                    server_id: server_id.to_string(),
                    reason: "server closed connection".to_string(),
                });
            }
            // Pings are handled by tungstenite; skip everything else.
            _ => continue,
        };

        let response: WsResponse = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => continue, // unsolicited or malformed frame
        };

        // Unsolicited event messages carry no (or a different) id.
        if response.id.as_deref() != Some(request_id.as_str()) {
            continue;
        }

        if let Some(error) = response.error {
            return Err(ToolError::ServerError {
                server_id: server_id.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        return Ok(render_payload(response.result.unwrap_or_default()));
    }
}

async fn http_call(
    http: &reqwest::Client,
    endpoint: &str,
    server_id: &str,
    action: &str,
    arguments: &serde_json::Value,
) -> Result<String, ToolError> {
    let url = format!("{}/call", endpoint.trim_end_matches('/'));
    let response = http
        .post(&url)
        .json(&HttpCallBody { action, arguments })
        .send()
        .await
        .map_err(|e| ToolError::Unreachable {
            server_id: server_id.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    let body: HttpCallResponse = response.json().await.unwrap_or(HttpCallResponse {
        result: None,
        error: None,
    });

    if !status.is_success() {
        let (code, message) = match body.error {
            Some(error) => (error.code, error.message),
            None => (i64::from(status.as_u16()), status.to_string()),
        };
        return Err(ToolError::ServerError {
            server_id: server_id.to_string(),
            code,
            message,
        });
    }

    if let Some(error) = body.error {
        return Err(ToolError::ServerError {
            server_id: server_id.to_string(),
            code: error.code,
            message: error.message,
        });
    }

    Ok(render_payload(body.result.unwrap_or_default()))
}
