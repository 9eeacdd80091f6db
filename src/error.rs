//! Error types, one enum per domain.
//!
//! Every subsystem has its own `thiserror` enum; the top-level [`Error`]
//! unifies them for callers that cross domain boundaries (the worker pool,
//! the platform wiring, `main`). Tool-level failures that must be shown to
//! the model never travel through these types; they are encoded as
//! invocation statuses and trajectory steps instead (see `task::ErrorKind`).

use std::time::Duration;

use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent from the environment.
    #[error("missing required setting '{key}'")]
    MissingRequired {
        /// Environment variable name.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// A setting is present but unusable.
    #[error("invalid value for '{key}': '{value}' ({reason})")]
    Invalid {
        /// Environment variable name.
        key: String,
        /// The offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Task queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing stream store cannot be reached.
    #[error("queue unavailable: {reason}")]
    Unavailable {
        /// Connection or protocol failure detail.
        reason: String,
    },

    /// The endpoint scheme names a backend this build does not provide.
    #[error("unsupported queue endpoint '{endpoint}'")]
    UnsupportedEndpoint {
        /// The configured endpoint string.
        endpoint: String,
    },

    /// The queue has been closed for shutdown.
    #[error("queue closed")]
    Closed,

    /// The submitted task failed field validation.
    #[error("invalid task: {reason}")]
    InvalidTask {
        /// What was out of range.
        reason: String,
    },
}

/// Tool orchestration errors.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No server registered under this id.
    #[error("unknown tool server '{server_id}'")]
    UnknownServer {
        /// Requested server id.
        server_id: String,
    },

    /// A server with this id is already registered.
    #[error("tool server '{server_id}' is already registered")]
    DuplicateServer {
        /// Conflicting server id.
        server_id: String,
    },

    /// The server exists but is not in the `ready` state.
    #[error("tool server '{server_id}' is not ready (state: {state})")]
    NotReady {
        /// Server id.
        server_id: String,
        /// Current lifecycle state.
        state: String,
    },

    /// The action is not among the server's capabilities.
    #[error("tool server '{server_id}' has no action '{action}'")]
    UnknownAction {
        /// Server id.
        server_id: String,
        /// Requested action.
        action: String,
    },

    /// Parameters failed validation against the capability schema.
    #[error("invalid parameters for {server_id}.{action}: {reason}")]
    InvalidParams {
        /// Server id.
        server_id: String,
        /// Action name.
        action: String,
        /// Human-readable validation failure, suitable for the model.
        reason: String,
    },

    /// The RPC exceeded its deadline.
    #[error("call to {server_id}.{action} timed out after {deadline:?}")]
    Timeout {
        /// Server id.
        server_id: String,
        /// Action name.
        action: String,
        /// Deadline that was exceeded.
        deadline: Duration,
    },

    /// Connection refused or dropped mid-call.
    #[error("tool server '{server_id}' unreachable: {reason}")]
    Unreachable {
        /// Server id.
        server_id: String,
        /// Transport-level detail.
        reason: String,
    },

    /// The server executed the call and returned a structured error.
    #[error("tool server '{server_id}' returned error {code}: {message}")]
    ServerError {
        /// Server id.
        server_id: String,
        /// Error code from the response envelope.
        code: i64,
        /// Error message from the response envelope.
        message: String,
    },

    /// No free port in the configured allocation window.
    #[error("no free port in range {lo}..={hi}")]
    PortExhausted {
        /// Window lower bound.
        lo: u16,
        /// Window upper bound.
        hi: u16,
    },

    /// The server source directory matched no known project layout.
    #[error("unknown project type at '{path}'")]
    UnknownProjectType {
        /// Inspected directory.
        path: String,
    },

    /// The server process could not be launched or failed its startup probe.
    #[error("failed to launch tool server '{server_id}': {reason}")]
    LaunchFailed {
        /// Server id.
        server_id: String,
        /// Spawn or probe failure detail.
        reason: String,
    },

    /// Dynamic install of a server source failed.
    #[error("failed to install tool server from '{source_ref}': {reason}")]
    InstallFailed {
        /// Git URL or local path.
        source_ref: String,
        /// Failure detail.
        reason: String,
    },

    /// The capability document shipped with a server is unusable.
    #[error("invalid capability document for '{server_id}': {reason}")]
    InvalidCapabilities {
        /// Server id.
        server_id: String,
        /// Parse or schema failure detail.
        reason: String,
    },

    /// Registry snapshot persistence failed.
    #[error("registry snapshot error: {reason}")]
    Snapshot {
        /// I/O or serialization detail.
        reason: String,
    },
}

/// LLM provider errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The HTTP request could not be completed.
    #[error("llm request to '{provider}' failed: {reason}")]
    RequestFailed {
        /// Logical provider name.
        provider: String,
        /// Transport or protocol detail.
        reason: String,
    },

    /// Credentials were rejected.
    #[error("llm authentication failed for '{provider}'")]
    AuthFailed {
        /// Logical provider name.
        provider: String,
    },

    /// The provider asked us to back off.
    #[error("llm provider '{provider}' rate limited")]
    RateLimited {
        /// Logical provider name.
        provider: String,
        /// Retry-after hint if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// The response could not be interpreted.
    #[error("invalid response from '{provider}': {reason}")]
    InvalidResponse {
        /// Logical provider name.
        provider: String,
        /// Parse failure detail.
        reason: String,
    },

    /// No token arrived within the idle window mid-stream.
    #[error("llm stream stalled: no tokens for {idle:?}")]
    Stalled {
        /// Idle window that elapsed.
        idle: Duration,
    },
}

/// Session store errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backing key-value store failed.
    #[error("session store error: {reason}")]
    Backend {
        /// Backend failure detail.
        reason: String,
    },

    /// The endpoint scheme names a backend this build does not provide.
    #[error("unsupported session store endpoint '{endpoint}'")]
    UnsupportedEndpoint {
        /// The configured endpoint string.
        endpoint: String,
    },

    /// Another worker held the session lock past the wait budget.
    #[error("session '{session_id}' locked by another worker")]
    LockTimeout {
        /// Contended session id.
        session_id: String,
    },
}

/// Trajectory recorder errors.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// Filesystem failure.
    #[error("trajectory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization failure.
    #[error("trajectory serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// `record_step` after `finalize`.
    #[error("trajectory for task {task_id} is already sealed")]
    Sealed {
        /// Task whose trajectory was finalized.
        task_id: uuid::Uuid,
    },
}

/// Top-level error for callers that cross domains.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
}
