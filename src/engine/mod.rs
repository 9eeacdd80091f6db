//! Reasoning Loop Engine.
//!
//! The stop-and-wait controller that drives the model through reason→act
//! rounds. Its one hard guarantee: the model never sees a tool result it
//! invented. Generation is streamed, the first tool invocation is
//! intercepted, the stream is cut, the call is executed for real, and the
//! genuine result is injected into history before the next round.

pub mod params;
pub mod runner;

use std::time::Duration;

use crate::task::{ErrorKind, Step, TrajectoryStatus};

pub use runner::ReasoningEngine;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default per-call RPC deadline when the capability declares none.
    pub default_tool_timeout: Duration,
    /// Idle window between streamed tokens before the turn fails.
    pub provider_idle_timeout: Duration,
    /// Parse repairs tolerated in one turn before the run is abandoned.
    pub repair_threshold: u32,
    /// Per-turn generation cap handed to the provider.
    pub max_tokens_per_turn: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_tool_timeout: Duration::from_secs(
                crate::config::DEFAULT_TOOL_CALL_TIMEOUT_SECONDS,
            ),
            provider_idle_timeout: Duration::from_secs(
                crate::config::DEFAULT_PROVIDER_IDLE_TIMEOUT_SECONDS,
            ),
            repair_threshold: 3,
            max_tokens_per_turn: 4096,
        }
    }
}

/// Loop states, one task at a time. The machine is explicit so timeouts,
/// cancellation, and partial failures are handled uniformly no matter
/// where they strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// About to request a completion (budget permitting).
    AwaitModel,
    /// Consuming the token stream.
    Streaming,
    /// Stream closed; the turn has been classified.
    Parsed,
    /// Executing the intercepted tool call(s).
    Dispatching,
    /// Real results appended to history.
    Injected,
    /// Terminal.
    Complete,
}

/// Terminal result of one engine run.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub status: TrajectoryStatus,
    pub error_kind: Option<ErrorKind>,
    pub final_answer: Option<String>,
    /// Every step recorded, in order, for session append.
    pub steps: Vec<Step>,
}
