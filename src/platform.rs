//! Platform wiring: construct every subsystem, run, shut down cleanly.
//!
//! Startup order matters: the crash scan runs before workers exist, the
//! registry restores its snapshot before static registration (snapshot
//! entries win on id collisions being skipped), and workers only start
//! once tool supervision is underway. Shutdown reverses it: stop claiming,
//! drain in-flight tasks, then terminate tool servers and snapshot the
//! registry.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::{
    Dispatcher, WorkerContext, WorkerPool, queue_from_endpoint, status_store_from_endpoint,
};
use crate::engine::{EngineConfig, ReasoningEngine};
use crate::error::Error;
use crate::llm::{LlmProvider, OpenAiCompatibleProvider};
use crate::orchestrator::ToolRegistry;
use crate::session::SessionStore;
use crate::task::{TaskState, TaskStatus};
use crate::trajectory::{TrajectoryRecorder, scan};

/// Interval for the background session purger.
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// A fully wired platform instance.
pub struct Platform {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionStore>,
    pub recorder: Arc<TrajectoryRecorder>,
    pool: WorkerPool,
    purger: tokio::task::JoinHandle<()>,
}

impl Platform {
    /// Build and start everything from configuration.
    pub async fn start(config: Config) -> Result<Self, Error> {
        let queue = queue_from_endpoint(&config.dispatch.endpoint)?;
        let status = status_store_from_endpoint(&config.dispatch.endpoint)?;
        let sessions = Arc::new(SessionStore::from_config(config.session.clone())?);
        let recorder = Arc::new(TrajectoryRecorder::new(
            config.trajectory_dir.clone(),
            config.trajectory_grouping,
        ));

        // Recovery scan: seal partial trajectories and surface them in the
        // status view before any worker can claim new work.
        let crashed = scan::scan_and_mark_crashed(&config.trajectory_dir).await?;
        for entry in &crashed {
            let record = TaskStatus {
                task_id: entry.task_id,
                state: TaskState::Crashed,
                last_step_id: entry.steps,
                attempt: entry.attempt,
                error_kind: None,
                message: Some("process exited mid-task".to_string()),
                heartbeat_at: None,
                updated_at: chrono::Utc::now(),
            };
            if let Err(e) = status.put(&record).await {
                tracing::warn!(task = %entry.task_id, "crash status write failed: {e}");
            }
        }
        if !crashed.is_empty() {
            tracing::warn!(count = crashed.len(), "sealed crashed trajectories");
        }

        let registry = Arc::new(ToolRegistry::new(config.orchestrator.clone()));
        match registry.load_snapshot().await {
            Ok(restored) if restored > 0 => {
                tracing::info!(restored, "restored tool servers from snapshot");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("registry snapshot restore failed: {e}"),
        }
        registry.register_static().await;

        let provider: Arc<dyn LlmProvider> = match config.llm.provider.as_str() {
            "openai_compatible" => Arc::new(OpenAiCompatibleProvider::new(&config.llm)?),
            other => {
                return Err(crate::error::ConfigError::Invalid {
                    key: "LLM_PROVIDER".to_string(),
                    value: other.to_string(),
                    reason: "this build provides 'openai_compatible'".to_string(),
                }
                .into());
            }
        };
        let engine = Arc::new(ReasoningEngine::new(
            provider,
            registry.clone(),
            EngineConfig {
                default_tool_timeout: config.orchestrator.default_call_timeout,
                provider_idle_timeout: config.llm.idle_timeout,
                ..EngineConfig::default()
            },
        ));

        let pool = WorkerPool::spawn(
            &config.dispatch.pool_sizes,
            WorkerContext {
                queue: queue.clone(),
                status: status.clone(),
                engine,
                sessions: sessions.clone(),
                recorder: recorder.clone(),
                memory_budget_bytes: config.dispatch.memory_budget_bytes,
            },
        );

        let purger = {
            let sessions = sessions.clone();
            let retention = config.session.retention;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = sessions.purge(retention).await {
                        tracing::warn!("session purge failed: {e}");
                    }
                }
            })
        };

        tracing::info!(
            trajectory_dir = %config.trajectory_dir.display(),
            "platform started"
        );

        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(queue, status)),
            registry,
            sessions,
            recorder,
            pool,
            purger,
            config,
        })
    }

    /// Graceful shutdown: drain workers, then tear down the tool fleet.
    pub async fn shutdown(self) {
        tracing::info!("platform shutting down");
        self.purger.abort();
        self.pool.shutdown(self.config.shutdown_grace).await;
        self.registry.shutdown().await;
        tracing::info!("platform stopped");
    }
}
