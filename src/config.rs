//! Environment-based configuration.
//!
//! Everything is read from environment variables (with `.env` support via
//! `dotenvy` in `main`). Missing required settings produce a
//! [`ConfigError::MissingRequired`] with a hint; malformed values produce
//! [`ConfigError::Invalid`] naming the variable and the reason.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::task::TaskType;
use crate::trajectory::Grouping;

/// Default tool server startup probe budget, in seconds.
pub const DEFAULT_TOOL_STARTUP_TIMEOUT_SECONDS: u64 = 30;
/// Default per-call tool RPC deadline, in seconds.
pub const DEFAULT_TOOL_CALL_TIMEOUT_SECONDS: u64 = 120;
/// Default provider idle window between streamed tokens, in seconds.
pub const DEFAULT_PROVIDER_IDLE_TIMEOUT_SECONDS: u64 = 60;
/// Default worker pool size per task type.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 2;
/// Default session retention window, in days.
pub const DEFAULT_SESSION_RETENTION_DAYS: u32 = 30;

/// LLM provider settings. The logical provider name and credential are
/// opaque to the core; they are threaded into the provider constructor.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Logical provider name (today: `openai_compatible`).
    pub provider: String,
    /// Base URL of the chat-completions endpoint.
    pub base_url: String,
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Bearer credential, if the endpoint wants one.
    pub api_key: Option<SecretString>,
    /// Idle window between streamed tokens before the turn fails.
    pub idle_timeout: Duration,
}

/// Tool orchestration settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Port allocation window for launched tool servers.
    pub port_range: (u16, u16),
    /// Startup probe budget per server.
    pub startup_timeout: Duration,
    /// Default per-call RPC deadline (capability overrides win).
    pub default_call_timeout: Duration,
    /// Maximum concurrent in-flight calls per server.
    pub max_in_flight_per_server: usize,
    /// Directories holding locally-installed tool servers to register at
    /// startup. Each directory name doubles as the server id.
    pub server_dirs: Vec<PathBuf>,
    /// Where the registry snapshot is persisted.
    pub snapshot_path: PathBuf,
}

/// Session store settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend endpoint; `memory:` selects the in-process store.
    pub endpoint: String,
    /// Hot cache capacity (sessions).
    pub cache_size: usize,
    /// Retention window for `purge`.
    pub retention: Duration,
    /// Soft step-count threshold beyond which `summarize` digests history.
    pub summarize_threshold: usize,
    /// Steps kept verbatim behind the digest.
    pub summarize_keep_recent: usize,
}

/// Dispatch fabric settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Queue endpoint; `memory:` selects the in-process stream store.
    pub endpoint: String,
    /// Worker pool size per task type.
    pub pool_sizes: HashMap<TaskType, usize>,
    /// Soft process memory budget; workers stop claiming above it.
    pub memory_budget_bytes: Option<u64>,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    /// Root directory for trajectory files.
    pub trajectory_dir: PathBuf,
    /// Directory grouping for trajectory files.
    pub trajectory_grouping: Grouping,
    /// Default assistant-turn budget when a task does not specify one.
    pub step_cap_default: u32,
    /// Graceful shutdown cap while draining in-flight tasks.
    pub shutdown_grace: Duration,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: format!("expected {}", std::any::type_name::<T>()),
    })
}

fn var_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match var(key) {
        Some(v) => parse_var(key, &v),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = var("LLM_BASE_URL").ok_or_else(|| ConfigError::MissingRequired {
            key: "LLM_BASE_URL".to_string(),
            hint: "set LLM_BASE_URL to an OpenAI-compatible chat completions endpoint"
                .to_string(),
        })?;
        let model = var("LLM_MODEL").ok_or_else(|| ConfigError::MissingRequired {
            key: "LLM_MODEL".to_string(),
            hint: "set LLM_MODEL to the model identifier the endpoint serves".to_string(),
        })?;

        let llm = LlmConfig {
            provider: var("LLM_PROVIDER").unwrap_or_else(|| "openai_compatible".to_string()),
            base_url,
            model,
            api_key: var("LLM_API_KEY").map(SecretString::from),
            idle_timeout: Duration::from_secs(var_parsed(
                "LLM_IDLE_TIMEOUT_SECONDS",
                DEFAULT_PROVIDER_IDLE_TIMEOUT_SECONDS,
            )?),
        };

        let lo: u16 = var_parsed("PORT_RANGE_LO", 8700)?;
        let hi: u16 = var_parsed("PORT_RANGE_HI", 8799)?;
        if lo > hi {
            return Err(ConfigError::Invalid {
                key: "PORT_RANGE_LO".to_string(),
                value: lo.to_string(),
                reason: format!("lower bound exceeds PORT_RANGE_HI ({hi})"),
            });
        }

        let trajectory_dir = var("TRAJECTORY_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("stride")
                .join("trajectories")
        });

        let grouping = match var("TRAJECTORY_GROUPING").as_deref() {
            None => Grouping::Daily,
            Some(raw) => raw.parse().map_err(|reason: String| ConfigError::Invalid {
                key: "TRAJECTORY_GROUPING".to_string(),
                value: raw.to_string(),
                reason,
            })?,
        };

        let orchestrator = OrchestratorConfig {
            port_range: (lo, hi),
            startup_timeout: Duration::from_secs(var_parsed(
                "TOOL_STARTUP_TIMEOUT_SECONDS",
                DEFAULT_TOOL_STARTUP_TIMEOUT_SECONDS,
            )?),
            default_call_timeout: Duration::from_secs(var_parsed(
                "TOOL_DEFAULT_CALL_TIMEOUT_SECONDS",
                DEFAULT_TOOL_CALL_TIMEOUT_SECONDS,
            )?),
            max_in_flight_per_server: var_parsed("TOOL_MAX_IN_FLIGHT", 4)?,
            server_dirs: var("TOOL_SERVER_DIRS")
                .map(|raw| raw.split(':').map(PathBuf::from).collect())
                .unwrap_or_default(),
            snapshot_path: var("TOOL_REGISTRY_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| trajectory_dir.join("registry-snapshot.json")),
        };

        let retention_days: u32 =
            var_parsed("SESSION_RETENTION_DAYS", DEFAULT_SESSION_RETENTION_DAYS)?;
        let session = SessionConfig {
            endpoint: var("SESSION_STORE_ENDPOINT").unwrap_or_else(|| "memory:".to_string()),
            cache_size: var_parsed("SESSION_CACHE_SIZE", 256)?,
            retention: Duration::from_secs(u64::from(retention_days) * 86_400),
            summarize_threshold: var_parsed("SESSION_SUMMARIZE_THRESHOLD", 20)?,
            summarize_keep_recent: var_parsed("SESSION_SUMMARIZE_KEEP_RECENT", 10)?,
        };

        let mut pool_sizes = HashMap::new();
        for task_type in TaskType::ALL {
            let key = format!("WORKER_POOL_SIZE_{}", task_type.as_str().to_uppercase());
            let size = match var(&key) {
                Some(v) => parse_var(&key, &v)?,
                None => DEFAULT_WORKER_POOL_SIZE,
            };
            pool_sizes.insert(task_type, size);
        }

        let dispatch = DispatchConfig {
            endpoint: var("QUEUE_ENDPOINT").unwrap_or_else(|| "memory:".to_string()),
            pool_sizes,
            memory_budget_bytes: match var("MEMORY_BUDGET_MB") {
                Some(v) => Some(parse_var::<u64>("MEMORY_BUDGET_MB", &v)? * 1024 * 1024),
                None => None,
            },
        };

        Ok(Self {
            llm,
            orchestrator,
            session,
            dispatch,
            trajectory_dir,
            trajectory_grouping: grouping,
            step_cap_default: var_parsed("STEP_CAP_DEFAULT", crate::task::DEFAULT_MAX_STEPS)?,
            shutdown_grace: Duration::from_secs(var_parsed("SHUTDOWN_GRACE_SECONDS", 600)?),
        })
    }
}
