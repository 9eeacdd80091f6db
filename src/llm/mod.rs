//! LLM provider abstraction.
//!
//! The reasoning engine depends only on [`LlmProvider`]: a streaming
//! completion interface with stop-sequence support. Buffered (non-streaming)
//! providers cannot implement the anti-fabrication contract: the engine
//! must see tokens as they are produced so it can cut generation at the
//! first tool block.

pub mod openai_compatible;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub use openai_compatible::OpenAiCompatibleProvider;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A streaming completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// In-band yield points. The provider must stop generation when any of
    /// these strings would be emitted; the stop string itself is not
    /// delivered as tokens.
    pub stop_sequences: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            stop_sequences: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.stop_sequences = stops;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A configured stop sequence was hit.
    StopSequence,
    /// The model ended its turn.
    EndTurn,
    /// The max-token budget was exhausted.
    Length,
    /// Provider-side content filter.
    ContentFilter,
    Unknown,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One item of a completion stream.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A fragment of generated text.
    Token(String),
    /// Terminal item; no further chunks follow.
    Done { reason: StopReason, usage: Usage },
}

/// Boxed token stream returned by providers.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// Streaming LLM provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a streaming completion. The returned stream yields tokens until
    /// a [`StreamChunk::Done`] item or an error.
    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, LlmError>;

    /// Model identifier, for logging and trajectory metadata.
    fn model_name(&self) -> &str;

    /// (input, output) price per token in dollars.
    fn cost_per_token(&self) -> (Decimal, Decimal);
}

/// Convert a usage record into integral micro-dollars at the provider's
/// per-token pricing.
pub fn cost_micros(usage: Usage, provider: &dyn LlmProvider) -> i64 {
    let (input_price, output_price) = provider.cost_per_token();
    let dollars = input_price * Decimal::from(usage.input_tokens)
        + output_price * Decimal::from(usage.output_tokens);
    (dollars * Decimal::from(1_000_000u64))
        .round()
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Rough token estimate for providers that omit usage metadata.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Whether an HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Exponential backoff with jitter for the given zero-based attempt.
pub fn retry_backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let base_ms = 500u64.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}
