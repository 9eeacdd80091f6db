//! Core data model: tasks, steps, trajectories, outcomes.
//!
//! These records are the durable vocabulary of the platform. Steps and
//! outcomes are append-only once written; everything that crosses a process
//! restart is keyed by opaque stable ids rather than in-memory references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default assistant-turn budget per task.
pub const DEFAULT_MAX_STEPS: u32 = 25;
/// Default wall-clock budget per task, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
/// Upper bound accepted for `max_steps`.
pub const MAX_STEPS_CEILING: u32 = 100;
/// Upper bound accepted for `priority`.
pub const MAX_PRIORITY: u8 = 3;

/// Category of a task; each type has its own queue stream and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Reasoning,
    Code,
    Web,
    Research,
    General,
}

impl TaskType {
    /// All task types, in stable order. Worker pools are sized per entry.
    pub const ALL: [TaskType; 5] = [
        TaskType::Reasoning,
        TaskType::Code,
        TaskType::Web,
        TaskType::Research,
        TaskType::General,
    ];

    /// Stable lowercase name, used in queue stream keys and env var suffixes.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Reasoning => "reasoning",
            TaskType::Code => "code",
            TaskType::Web => "web",
            TaskType::Research => "research",
            TaskType::General => "general",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reasoning" => Ok(TaskType::Reasoning),
            "code" => Ok(TaskType::Code),
            "web" => Ok(TaskType::Web),
            "research" => Ok(TaskType::Research),
            "general" => Ok(TaskType::General),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work. Created by the submission layer, consumed exactly once
/// by a worker, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique, time-ordered id.
    pub task_id: Uuid,
    /// Natural-language description handed to the model verbatim.
    pub description: String,
    pub task_type: TaskType,
    /// 0 (lowest) ..= 3 (highest).
    pub priority: u8,
    /// Assistant-turn budget, 1..=100.
    pub max_steps: u32,
    /// Wall-clock budget. Zero means the task times out on first provider read.
    pub timeout_seconds: u64,
    /// Groups related tasks into a shared memory scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with defaults for everything but the description and type.
    pub fn new(description: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            description: description.into(),
            task_type,
            priority: 0,
            max_steps: DEFAULT_MAX_STEPS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            session_id: None,
            submitted_at: Utc::now(),
        }
    }

    /// Set the priority (clamped to the accepted range at validation time).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the assistant-turn budget.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the wall-clock budget in seconds.
    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Attach the task to a session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Validate field ranges. Returns a human-readable reason on rejection.
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("description must not be empty".to_string());
        }
        if self.priority > MAX_PRIORITY {
            return Err(format!(
                "priority {} out of range 0..={MAX_PRIORITY}",
                self.priority
            ));
        }
        if self.max_steps == 0 || self.max_steps > MAX_STEPS_CEILING {
            return Err(format!(
                "max_steps {} out of range 1..={MAX_STEPS_CEILING}",
                self.max_steps
            ));
        }
        Ok(())
    }
}

/// Kind of a single trajectory step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Think,
    ToolCall,
    ToolResult,
    Answer,
    Error,
}

/// One turn event in the reason→act loop. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Monotonic, gap-free within a task, starting at 1.
    pub step_id: u32,
    pub timestamp: DateTime<Utc>,
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Step payload: think text, rendered tool result, answer text, or a
    /// normalized error record.
    pub output: String,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_micros: i64,
    pub success: bool,
}

impl Step {
    fn base(step_id: u32, kind: StepKind, output: String) -> Self {
        Self {
            step_id,
            timestamp: Utc::now(),
            kind,
            tool_name: None,
            tool_action: None,
            parameters: None,
            output,
            duration_ms: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_micros: 0,
            success: true,
        }
    }

    /// Scratch-pad text echoed from the model.
    pub fn think(step_id: u32, text: impl Into<String>) -> Self {
        Self::base(step_id, StepKind::Think, text.into())
    }

    /// A tool invocation request as parsed from the model.
    pub fn tool_call(
        step_id: u32,
        server_id: impl Into<String>,
        action: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        let mut step = Self::base(step_id, StepKind::ToolCall, String::new());
        step.tool_name = Some(server_id.into());
        step.tool_action = Some(action.into());
        step.parameters = Some(parameters);
        step
    }

    /// The result of the immediately preceding tool call.
    pub fn tool_result(
        step_id: u32,
        server_id: impl Into<String>,
        action: impl Into<String>,
        output: impl Into<String>,
        success: bool,
    ) -> Self {
        let mut step = Self::base(step_id, StepKind::ToolResult, output.into());
        step.tool_name = Some(server_id.into());
        step.tool_action = Some(action.into());
        step.success = success;
        step
    }

    /// Terminal answer text.
    pub fn answer(step_id: u32, text: impl Into<String>) -> Self {
        Self::base(step_id, StepKind::Answer, text.into())
    }

    /// A normalized error event.
    pub fn error(step_id: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut step = Self::base(
            step_id,
            StepKind::Error,
            format!("{}: {}", kind.as_str(), message.into()),
        );
        step.success = false;
        step
    }

    /// An error event outside the normalized kind set (e.g. cancellation,
    /// which is an outcome status rather than an error kind).
    pub fn error_raw(step_id: u32, label: &str, message: impl Into<String>) -> Self {
        let mut step = Self::base(
            step_id,
            StepKind::Error,
            format!("{label}: {}", message.into()),
        );
        step.success = false;
        step
    }

    /// Attach duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Attach token and cost accounting for the turn that produced this step.
    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64, cost_micros: i64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self.cost_micros = cost_micros;
        self
    }
}

/// Normalized error kinds, surfaced in logs and `error` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParams,
    ToolError,
    Timeout,
    Unreachable,
    FabricatedResult,
    UnparseableOutput,
    ProviderStalled,
    StepCap,
    TaskTimeout,
    RedeliveryExhausted,
    QueueUnavailable,
    SessionConflict,
}

impl ErrorKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::FabricatedResult => "fabricated_result",
            ErrorKind::UnparseableOutput => "unparseable_output",
            ErrorKind::ProviderStalled => "provider_stalled",
            ErrorKind::StepCap => "step_cap",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::RedeliveryExhausted => "redelivery_exhausted",
            ErrorKind::QueueUnavailable => "queue_unavailable",
            ErrorKind::SessionConflict => "session_conflict",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal disposition of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    Success,
    Failed,
    Cancelled,
    Timeout,
    /// Assigned by the startup scan when a file has steps but no outcome.
    Crashed,
}

/// Lifecycle state as reported by `status(task_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    Crashed,
}

impl TaskState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

impl From<TrajectoryStatus> for TaskState {
    fn from(status: TrajectoryStatus) -> Self {
        match status {
            TrajectoryStatus::Success => TaskState::Succeeded,
            TrajectoryStatus::Failed => TaskState::Failed,
            TrajectoryStatus::Cancelled => TaskState::Cancelled,
            TrajectoryStatus::Timeout => TaskState::TimedOut,
            TrajectoryStatus::Crashed => TaskState::Crashed,
        }
    }
}

/// Mutable status record kept in the key-value store, one per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub state: TaskState,
    /// Highest step_id written so far.
    pub last_step_id: u32,
    /// Delivery attempt currently (or last) executing this task.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    /// Fresh `pending` status for a just-submitted task.
    pub fn pending(task_id: Uuid) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            last_step_id: 0,
            attempt: 0,
            error_kind: None,
            message: None,
            heartbeat_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Transition to `running` under the given delivery attempt.
    pub fn running(task_id: Uuid, attempt: u32) -> Self {
        Self {
            task_id,
            state: TaskState::Running,
            last_step_id: 0,
            attempt,
            error_kind: None,
            message: None,
            heartbeat_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }

    /// Whether the heartbeat is older than the staleness window.
    pub fn heartbeat_stale(&self, window: std::time::Duration) -> bool {
        match self.heartbeat_at {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().map(|a| a > window).unwrap_or(false)
            }
            // Running with no heartbeat at all counts as stale.
            None => self.state == TaskState::Running,
        }
    }
}

/// Platform/runtime fingerprint embedded in every outcome record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub version: String,
}

impl Environment {
    /// Capture the current process environment once.
    pub fn capture() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Sealed summary written as the last record of a trajectory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub task_id: Uuid,
    pub attempt: u32,
    pub status: TrajectoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    pub steps: u32,
    pub total_duration_ms: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_micros: i64,
    pub environment: Environment,
}

/// The ordered steps of a single task plus its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub steps: Vec<Step>,
    pub outcome: Outcome,
}
