//! OpenAI-compatible streaming chat provider.
//!
//! Targets third-party OpenAI-compatible endpoints (vLLM, LiteLLM, local
//! proxies). Generation is consumed over SSE so the engine sees tokens as
//! they are produced; stop sequences are passed through in the request body
//! and surface as a `finish_reason` of `stop`.

use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionStream, LlmProvider, Role, StopReason, StreamChunk,
    Usage, estimate_tokens, is_retryable_status, retry_backoff_delay,
};

const PROVIDER: &str = "openai_compatible";
const MAX_CONNECT_RETRIES: u32 = 3;

/// Streaming provider over `/v1/chat/completions`.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleProvider {
    /// Build a provider from configuration.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            // Overall request timeout is left unset: a streaming completion
            // legitimately runs for minutes. Idle detection is the engine's.
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn api_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn bearer(&self) -> String {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_else(|| "no-key".to_string())
    }

    fn build_body(&self, req: &CompletionRequest) -> ChatStreamRequest {
        ChatStreamRequest {
            model: self.model.clone(),
            messages: req.messages.iter().map(WireMessage::from).collect(),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            stop: if req.stop_sequences.is_empty() {
                None
            } else {
                Some(req.stop_sequences.clone())
            },
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, LlmError> {
        let body = self.build_body(&req);
        let url = self.api_url();
        let builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .header("Content-Type", "application/json")
            .json(&body);

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamChunk, LlmError>>(32);
        tokio::spawn(pump_stream(builder, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        // Conservative defaults for unlabeled endpoints.
        (dec!(0.000003), dec!(0.000015))
    }
}

/// Drive one SSE completion, forwarding chunks into `tx`.
///
/// Connection-level failures before the first token are retried with
/// backoff; once tokens have flowed, failures are surfaced as-is because a
/// retried stream would replay text the caller already consumed.
async fn pump_stream(
    builder: reqwest::RequestBuilder,
    tx: tokio::sync::mpsc::Sender<Result<StreamChunk, LlmError>>,
) {
    let mut attempt = 0u32;

    'retry: loop {
        let Some(cloned) = builder.try_clone() else {
            let _ = tx
                .send(Err(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: "request body not cloneable".to_string(),
                }))
                .await;
            return;
        };

        let mut source = match EventSource::new(cloned) {
            Ok(s) => s,
            Err(e) => {
                let _ = tx
                    .send(Err(LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    }))
                    .await;
                return;
            }
        };

        let mut tokens_sent = false;
        let mut generated = String::new();
        let mut usage: Option<Usage> = None;
        let mut finish: Option<StopReason> = None;

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data.trim() == "[DONE]" {
                        break;
                    }
                    let chunk: ChatStreamChunk = match serde_json::from_str(&msg.data) {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = tx
                                .send(Err(LlmError::InvalidResponse {
                                    provider: PROVIDER.to_string(),
                                    reason: format!("bad stream chunk: {e}"),
                                }))
                                .await;
                            return;
                        }
                    };

                    if let Some(u) = chunk.usage {
                        usage = Some(Usage {
                            input_tokens: u.prompt_tokens.unwrap_or(0),
                            output_tokens: u.completion_tokens.unwrap_or(0),
                        });
                    }

                    if let Some(choice) = chunk.choices.into_iter().next() {
                        if let Some(text) = choice.delta.content
                            && !text.is_empty()
                        {
                            tokens_sent = true;
                            generated.push_str(&text);
                            if tx.send(Ok(StreamChunk::Token(text))).await.is_err() {
                                // Receiver dropped: the engine aborted this
                                // generation (hallucination defense, cancel).
                                return;
                            }
                        }
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            finish = Some(parse_finish_reason(reason));
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(code, _response)) => {
                    let status = code.as_u16();
                    if !tokens_sent && is_retryable_status(status) && attempt < MAX_CONNECT_RETRIES
                    {
                        let delay = retry_backoff_delay(attempt);
                        attempt += 1;
                        tracing::warn!(
                            status,
                            attempt,
                            "provider returned retryable status, backing off {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue 'retry;
                    }
                    let err = if status == 401 {
                        LlmError::AuthFailed {
                            provider: PROVIDER.to_string(),
                        }
                    } else if status == 429 {
                        LlmError::RateLimited {
                            provider: PROVIDER.to_string(),
                            retry_after: None,
                        }
                    } else {
                        LlmError::RequestFailed {
                            provider: PROVIDER.to_string(),
                            reason: format!("HTTP {status}"),
                        }
                    };
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                Err(e) => {
                    if !tokens_sent && attempt < MAX_CONNECT_RETRIES {
                        let delay = retry_backoff_delay(attempt);
                        attempt += 1;
                        tracing::warn!(attempt, "provider stream error, backing off {:?}: {e}", delay);
                        tokio::time::sleep(delay).await;
                        continue 'retry;
                    }
                    let _ = tx
                        .send(Err(LlmError::RequestFailed {
                            provider: PROVIDER.to_string(),
                            reason: e.to_string(),
                        }))
                        .await;
                    return;
                }
            }
        }

        // Some endpoints omit usage even when asked; estimate so step and
        // outcome accounting stays internally consistent.
        let usage = usage.unwrap_or_else(|| Usage {
            input_tokens: 0,
            output_tokens: estimate_tokens(&generated),
        });

        let _ = tx
            .send(Ok(StreamChunk::Done {
                reason: finish.unwrap_or(StopReason::Unknown),
                usage,
            }))
            .await;
        return;
    }
}

fn parse_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::StopSequence,
        "length" => StopReason::Length,
        "content_filter" => StopReason::ContentFilter,
        "end_turn" => StopReason::EndTurn,
        _ => StopReason::Unknown,
    }
}

// Wire types for the streaming chat completions API.

#[derive(Debug, Serialize)]
struct ChatStreamRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LlmConfig {
        LlmConfig {
            provider: PROVIDER.to_string(),
            base_url: "http://127.0.0.1:8318".to_string(),
            model: "test-model".to_string(),
            api_key: None,
            idle_timeout: std::time::Duration::from_secs(60),
        }
    }

    #[test]
    fn test_api_url_without_v1_suffix() {
        let provider = OpenAiCompatibleProvider::new(&test_config()).expect("provider");
        assert_eq!(
            provider.api_url(),
            "http://127.0.0.1:8318/v1/chat/completions"
        );
    }

    #[test]
    fn test_api_url_with_v1_suffix() {
        let mut cfg = test_config();
        cfg.base_url = "http://127.0.0.1:8318/v1/".to_string();
        let provider = OpenAiCompatibleProvider::new(&cfg).expect("provider");
        assert_eq!(
            provider.api_url(),
            "http://127.0.0.1:8318/v1/chat/completions"
        );
    }

    #[test]
    fn test_body_includes_stops_and_usage_flag() {
        let provider = OpenAiCompatibleProvider::new(&test_config()).expect("provider");
        let req = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_stop_sequences(vec!["</answer>".to_string()]);
        let body = provider.build_body(&req);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], serde_json::json!(true));
        assert_eq!(json["stream_options"]["include_usage"], serde_json::json!(true));
        assert_eq!(json["stop"][0], serde_json::json!("</answer>"));
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_parse_finish_reason() {
        assert_eq!(parse_finish_reason("stop"), StopReason::StopSequence);
        assert_eq!(parse_finish_reason("length"), StopReason::Length);
        assert_eq!(parse_finish_reason("content_filter"), StopReason::ContentFilter);
        assert_eq!(parse_finish_reason("anything"), StopReason::Unknown);
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let raw = r#"{"choices":[{"delta":{"content":"4"},"finish_reason":null}]}"#;
        let chunk: ChatStreamChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("4"));

        let raw = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let chunk: ChatStreamChunk = serde_json::from_str(raw).unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(3));
    }
}
