//! Tool server records, capabilities, and invocations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::task::ErrorKind;

/// Lifecycle state of a registered tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Registered, not yet launched.
    Pending,
    /// Process launched, readiness probe in progress.
    Starting,
    /// Passed at least one health check; accepting invocations.
    Ready,
    /// Repeated liveness failures; new invocations fail fast.
    Degraded,
    /// Process gone; restart may be scheduled.
    Stopped,
    /// Startup failed or restart budget exhausted.
    Failed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Pending => "pending",
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Degraded => "degraded",
            ServerState::Stopped => "stopped",
            ServerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Detected project layout of a tool server source directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Python,
    Node,
    Ts,
    Rust,
    Go,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Python => "python",
            ProjectType::Node => "node",
            ProjectType::Ts => "ts",
            ProjectType::Rust => "rust",
            ProjectType::Go => "go",
        }
    }
}

/// Declared type of a capability parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Whether a JSON value conforms to this type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// One declared parameter of a capability. Declaration order is preserved
/// and drives both validation messages and prompt rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// A tool action exposed by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Per-capability RPC deadline override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Capability {
    /// The single required parameter, if there is exactly one. Free-text
    /// parameter mapping is only legal in that case.
    pub fn sole_required_parameter(&self) -> Option<&ParameterSpec> {
        let mut required = self.parameters.iter().filter(|p| p.required);
        match (required.next(), required.next()) {
            (Some(param), None) => Some(param),
            _ => None,
        }
    }

    /// One-line summary of expected fields, for error messages shown to the
    /// model.
    pub fn expected_fields(&self) -> String {
        if self.parameters.is_empty() {
            return "no parameters".to_string();
        }
        self.parameters
            .iter()
            .map(|p| {
                format!(
                    "{}{} ({})",
                    p.name,
                    if p.required { "*" } else { "" },
                    p.param_type.as_str()
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Validate a JSON object against this capability's parameters: required
    /// fields present, declared types respected, defaults filled in.
    pub fn validate_params(
        &self,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let object = params
            .as_object()
            .ok_or_else(|| format!("parameters must be a JSON object; expected fields: {}", self.expected_fields()))?;

        let mut filled = object.clone();
        for spec in &self.parameters {
            match filled.get(&spec.name) {
                Some(value) => {
                    if !spec.param_type.matches(value) {
                        return Err(format!(
                            "parameter '{}' must be of type {}; expected fields: {}",
                            spec.name,
                            spec.param_type.as_str(),
                            self.expected_fields()
                        ));
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        filled.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(format!(
                            "missing required parameter '{}'; expected fields: {}",
                            spec.name,
                            self.expected_fields()
                        ));
                    }
                }
            }
        }

        Ok(serde_json::Value::Object(filled))
    }
}

/// The static JSON document shipped with a tool server
/// (`capabilities.json` in its root).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDoc {
    /// Transport scheme the server speaks: `http` (default) or `ws`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Entry point file, relative to the server root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Explicit launch command overriding the project-type default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<Vec<String>>,
    pub capabilities: Vec<Capability>,
}

fn default_scheme() -> String {
    "http".to_string()
}

/// A registered external tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    /// Stable id, e.g. `microsandbox`. Doubles as the tag the model uses.
    pub server_id: String,
    /// `ws://` or `http://` URL the RPC layer talks to.
    pub endpoint: String,
    pub project_type: ProjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<Vec<String>>,
    pub working_dir: PathBuf,
    pub allocated_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: ServerState,
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl ToolServer {
    /// Find a capability by action name.
    pub fn capability(&self, action: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.action == action)
    }
}

/// Terminal status of one capability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Ok,
    ToolError,
    Timeout,
    Unreachable,
    InvalidParams,
}

impl InvocationStatus {
    /// The normalized error kind for non-ok statuses.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            InvocationStatus::Ok => None,
            InvocationStatus::ToolError => Some(ErrorKind::ToolError),
            InvocationStatus::Timeout => Some(ErrorKind::Timeout),
            InvocationStatus::Unreachable => Some(ErrorKind::Unreachable),
            InvocationStatus::InvalidParams => Some(ErrorKind::InvalidParams),
        }
    }
}

/// A single call to a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: Uuid,
    pub task_id: Uuid,
    pub step_id: u32,
    pub server_id: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: InvocationStatus,
    /// Result payload on success, or a human-readable error record.
    pub result: String,
    pub attempt: u32,
}
