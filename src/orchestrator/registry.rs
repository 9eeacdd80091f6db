//! Tool server registry: registration, snapshot recovery, invocation routing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::ToolError;
use crate::orchestrator::project::{detect_project_type, launch_command};
use crate::orchestrator::rpc::{self, WsPool};
use crate::orchestrator::server::{
    Capability, CapabilityDoc, Invocation, InvocationStatus, ProjectType, ServerState, ToolServer,
};
use crate::orchestrator::supervisor::{spawn_supervisor, terminate};
use crate::orchestrator::{CatalogEntry, InvokeRequest, Invoker, error_record};

/// Drain budget when removing a server with calls in flight.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared per-server runtime state. The durable fields live in
/// [`ToolServer`]; everything else here is process-local.
pub struct ServerHandle {
    pub record: RwLock<ToolServer>,
    /// In-flight cap; waiting acquirers are served FIFO.
    pub limiter: Arc<Semaphore>,
    /// Pooled WebSocket connection, if the server speaks `ws://`.
    pub ws: WsPool,
    pub process: Mutex<Option<Child>>,
    pub cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// In-memory map of live tool servers, backed by a durable JSON snapshot
/// for crash recovery. Reads (invocations) vastly outnumber writes
/// (registrations), hence the reader-writer lock.
pub struct ToolRegistry {
    servers: RwLock<HashMap<String, Arc<ServerHandle>>>,
    ports: crate::orchestrator::ports::PortAllocator,
    config: OrchestratorConfig,
    http: reqwest::Client,
}

impl ToolRegistry {
    pub fn new(config: OrchestratorConfig) -> Self {
        let (lo, hi) = config.port_range;
        Self {
            servers: RwLock::new(HashMap::new()),
            ports: crate::orchestrator::ports::PortAllocator::new(lo, hi),
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Register every server directory listed in the configuration.
    /// Individual failures are logged and skipped so one broken server
    /// cannot keep the platform down.
    pub async fn register_static(self: &Arc<Self>) {
        for dir in self.config.server_dirs.clone() {
            match self.register_from_dir(&dir, None).await {
                Ok(server_id) => {
                    tracing::info!(server = %server_id, "registered tool server from {}", dir.display());
                }
                Err(e) => {
                    tracing::error!("skipping tool server at {}: {e}", dir.display());
                }
            }
        }
    }

    /// Register a server from a local source directory. The directory name
    /// doubles as the server id unless one is given.
    pub async fn register_from_dir(
        self: &Arc<Self>,
        dir: &Path,
        server_id: Option<String>,
    ) -> Result<String, ToolError> {
        let server_id = match server_id {
            Some(id) => id,
            None => dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| ToolError::UnknownProjectType {
                    path: dir.display().to_string(),
                })?,
        };

        let project_type = detect_project_type(dir)?;
        let doc = read_capability_doc(&server_id, dir)?;

        let port = self.ports.allocate()?;
        let endpoint = format!("{}://127.0.0.1:{}", doc.scheme, port);
        let command = doc
            .launch
            .clone()
            .unwrap_or_else(|| launch_command(project_type, dir, doc.entry.as_deref()));

        let record = ToolServer {
            server_id: server_id.clone(),
            endpoint,
            project_type,
            launch_command: Some(command),
            working_dir: dir.to_path_buf(),
            allocated_port: port,
            pid: None,
            state: ServerState::Pending,
            capabilities: doc.capabilities,
            last_health_check: None,
            consecutive_failures: 0,
        };

        if let Err(e) = self.insert_and_supervise(record).await {
            self.ports.release(port);
            return Err(e);
        }
        Ok(server_id)
    }

    /// Register an externally managed server: an endpoint that is already
    /// running and is not supervised as a child process.
    pub async fn register_endpoint(
        self: &Arc<Self>,
        server_id: impl Into<String>,
        endpoint: impl Into<String>,
        project_type: ProjectType,
        capabilities: Vec<Capability>,
    ) -> Result<(), ToolError> {
        let endpoint = endpoint.into();
        let port = url::Url::parse(&endpoint)
            .ok()
            .and_then(|u| u.port())
            .unwrap_or(0);

        let record = ToolServer {
            server_id: server_id.into(),
            endpoint,
            project_type,
            launch_command: None,
            working_dir: std::path::PathBuf::from("."),
            allocated_port: port,
            pid: None,
            state: ServerState::Pending,
            capabilities,
            last_health_check: None,
            consecutive_failures: 0,
        };
        self.insert_and_supervise(record).await
    }

    async fn insert_and_supervise(self: &Arc<Self>, record: ToolServer) -> Result<(), ToolError> {
        let server_id = record.server_id.clone();
        let handle = Arc::new(ServerHandle {
            record: RwLock::new(record),
            limiter: Arc::new(Semaphore::new(self.config.max_in_flight_per_server)),
            ws: Mutex::new(None),
            process: Mutex::new(None),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        {
            let mut servers = self.servers.write().await;
            if servers.contains_key(&server_id) {
                return Err(ToolError::DuplicateServer { server_id });
            }
            servers.insert(server_id.clone(), handle.clone());
        }

        let task = spawn_supervisor(handle.clone(), self.config.clone(), self.http.clone());
        *handle.supervisor.lock().await = Some(task);
        Ok(())
    }

    /// Remove a server: stop accepting calls, drain in-flight invocations,
    /// then terminate the process.
    pub async fn remove(&self, server_id: &str) -> Result<(), ToolError> {
        let handle = {
            let mut servers = self.servers.write().await;
            servers
                .remove(server_id)
                .ok_or_else(|| ToolError::UnknownServer {
                    server_id: server_id.to_string(),
                })?
        };

        // New invocations can no longer find the server; mark it stopped so
        // a racing invoke that already holds the handle fails fast too.
        handle.record.write().await.state = ServerState::Stopped;
        handle.cancel.cancel();

        // Drain: once every permit is reclaimed, no call is in flight.
        let max = self.config.max_in_flight_per_server as u32;
        let drained =
            tokio::time::timeout(DRAIN_TIMEOUT, handle.limiter.acquire_many(max)).await;
        if drained.is_err() {
            tracing::warn!(server = %server_id, "drain timed out; terminating with calls in flight");
        }

        if let Some(task) = handle.supervisor.lock().await.take() {
            task.abort();
        }
        terminate(&handle).await;

        let port = handle.record.read().await.allocated_port;
        self.ports.release(port);
        tracing::info!(server = %server_id, "tool server removed");
        Ok(())
    }

    /// Snapshot all registered servers to the configured path.
    pub async fn save_snapshot(&self) -> Result<(), ToolError> {
        let servers = self.servers.read().await;
        let mut records = Vec::with_capacity(servers.len());
        for handle in servers.values() {
            records.push(handle.record.read().await.clone());
        }
        records.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        let json = serde_json::to_vec_pretty(&records).map_err(|e| ToolError::Snapshot {
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.config.snapshot_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Snapshot {
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(&self.config.snapshot_path, json)
            .await
            .map_err(|e| ToolError::Snapshot {
                reason: e.to_string(),
            })
    }

    /// Restore registrations from the snapshot, if one exists. Servers are
    /// re-launched from scratch; runtime state in the snapshot is ignored.
    pub async fn load_snapshot(self: &Arc<Self>) -> Result<usize, ToolError> {
        let bytes = match tokio::fs::read(&self.config.snapshot_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(ToolError::Snapshot {
                    reason: e.to_string(),
                });
            }
        };
        let records: Vec<ToolServer> =
            serde_json::from_slice(&bytes).map_err(|e| ToolError::Snapshot {
                reason: e.to_string(),
            })?;

        let mut restored = 0;
        for mut record in records {
            if self.servers.read().await.contains_key(&record.server_id) {
                continue;
            }
            if record.launch_command.is_some() {
                let port = self.ports.reserve(record.allocated_port)?;
                if port != record.allocated_port {
                    record.allocated_port = port;
                    record.endpoint = rewrite_port(&record.endpoint, port);
                }
            }
            record.state = ServerState::Pending;
            record.pid = None;
            record.last_health_check = None;
            record.consecutive_failures = 0;
            let server_id = record.server_id.clone();
            match self.insert_and_supervise(record).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::error!(server = %server_id, "snapshot restore failed: {e}"),
            }
        }
        Ok(restored)
    }

    /// All registered server records, sorted by id.
    pub async fn servers(&self) -> Vec<ToolServer> {
        let servers = self.servers.read().await;
        let mut records = Vec::with_capacity(servers.len());
        for handle in servers.values() {
            records.push(handle.record.read().await.clone());
        }
        records.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        records
    }

    /// Gracefully stop everything: snapshot, then terminate each server.
    pub async fn shutdown(&self) {
        if let Err(e) = self.save_snapshot().await {
            tracing::warn!("registry snapshot on shutdown failed: {e}");
        }
        let handles: Vec<(String, Arc<ServerHandle>)> = {
            let mut servers = self.servers.write().await;
            servers.drain().collect()
        };
        for (server_id, handle) in handles {
            handle.cancel.cancel();
            if let Some(task) = handle.supervisor.lock().await.take() {
                task.abort();
            }
            terminate(&handle).await;
            tracing::debug!(server = %server_id, "tool server terminated");
        }
    }

    async fn handle(&self, server_id: &str) -> Option<Arc<ServerHandle>> {
        self.servers.read().await.get(server_id).cloned()
    }

    async fn known_server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Per-capability deadline: the declared override, or the configured
    /// default, never more than the caller's remaining budget.
    fn effective_deadline(&self, capability: &Capability, requested: Duration) -> Duration {
        let base = capability
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_call_timeout);
        base.min(requested)
    }
}

fn read_capability_doc(server_id: &str, dir: &Path) -> Result<CapabilityDoc, ToolError> {
    let path = dir.join("capabilities.json");
    let bytes = std::fs::read(&path).map_err(|e| ToolError::InvalidCapabilities {
        server_id: server_id.to_string(),
        reason: format!("{}: {e}", path.display()),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| ToolError::InvalidCapabilities {
        server_id: server_id.to_string(),
        reason: e.to_string(),
    })
}

fn rewrite_port(endpoint: &str, port: u16) -> String {
    match url::Url::parse(endpoint) {
        Ok(mut url) => {
            let _ = url.set_port(Some(port));
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => endpoint.to_string(),
    }
}

#[async_trait::async_trait]
impl Invoker for ToolRegistry {
    async fn invoke(&self, req: InvokeRequest) -> Invocation {
        let started_at = Utc::now();
        let started = Instant::now();

        let finish = |status: InvocationStatus, result: String, parameters: serde_json::Value| {
            Invocation {
                invocation_id: Uuid::new_v4(),
                task_id: req.task_id,
                step_id: req.step_id,
                server_id: req.server_id.clone(),
                action: req.action.clone(),
                parameters,
                started_at,
                finished_at: Utc::now(),
                status,
                result,
                attempt: req.attempt,
            }
        };

        let Some(handle) = self.handle(&req.server_id).await else {
            let known = self.known_server_ids().await.join(", ");
            return finish(
                InvocationStatus::Unreachable,
                error_record(
                    "unreachable",
                    &format!(
                        "unknown tool server '{}'; available servers: {}",
                        req.server_id,
                        if known.is_empty() { "(none)" } else { &known }
                    ),
                ),
                req.parameters.clone(),
            );
        };

        let (state, endpoint, capability) = {
            let record = handle.record.read().await;
            (
                record.state,
                record.endpoint.clone(),
                record.capability(&req.action).cloned(),
            )
        };

        if state != ServerState::Ready {
            return finish(
                InvocationStatus::Unreachable,
                error_record(
                    "unreachable",
                    &format!("tool server '{}' is not ready (state: {state})", req.server_id),
                ),
                req.parameters.clone(),
            );
        }

        let Some(capability) = capability else {
            let actions: Vec<String> = {
                let record = handle.record.read().await;
                record.capabilities.iter().map(|c| c.action.clone()).collect()
            };
            return finish(
                InvocationStatus::InvalidParams,
                error_record(
                    "invalid_params",
                    &format!(
                        "unknown action '{}' on server '{}'; available actions: {}",
                        req.action,
                        req.server_id,
                        actions.join(", ")
                    ),
                ),
                req.parameters.clone(),
            );
        };

        // Validate before any network I/O.
        let parameters = match capability.validate_params(&req.parameters) {
            Ok(filled) => filled,
            Err(reason) => {
                return finish(
                    InvocationStatus::InvalidParams,
                    error_record("invalid_params", &reason),
                    req.parameters.clone(),
                );
            }
        };

        let deadline = self.effective_deadline(&capability, req.deadline);

        // FIFO admission under the per-server in-flight cap; the deadline
        // covers queueing time as well as the call itself.
        let outcome = tokio::time::timeout(deadline, async {
            let _permit = handle.limiter.acquire().await.map_err(|_| {
                ToolError::Unreachable {
                    server_id: req.server_id.clone(),
                    reason: "server draining".to_string(),
                }
            })?;
            let remaining = deadline.saturating_sub(started.elapsed());
            rpc::call_tool(
                &self.http,
                &handle.ws,
                &endpoint,
                &req.server_id,
                &req.action,
                &parameters,
                remaining,
            )
            .await
        })
        .await;

        let result = match outcome {
            Err(_) => Err(ToolError::Timeout {
                server_id: req.server_id.clone(),
                action: req.action.clone(),
                deadline,
            }),
            Ok(inner) => inner,
        };

        match result {
            Ok(payload) => finish(InvocationStatus::Ok, payload, parameters),
            Err(ToolError::Timeout { deadline, .. }) => finish(
                InvocationStatus::Timeout,
                error_record(
                    "timeout",
                    &format!("call exceeded its deadline of {deadline:?}"),
                ),
                parameters,
            ),
            Err(ToolError::ServerError { code, message, .. }) => finish(
                InvocationStatus::ToolError,
                error_record("tool_error", &format!("server error {code}: {message}")),
                parameters,
            ),
            Err(e) => {
                // Connection-level failure: bump the failure counter so the
                // next liveness probe can demote the server.
                handle.record.write().await.consecutive_failures += 1;
                finish(
                    InvocationStatus::Unreachable,
                    error_record("unreachable", &e.to_string()),
                    parameters,
                )
            }
        }
    }

    async fn catalog(&self) -> Vec<CatalogEntry> {
        let servers = self.servers.read().await;
        let mut entries = Vec::new();
        for handle in servers.values() {
            let record = handle.record.read().await;
            if record.state == ServerState::Ready {
                entries.push(CatalogEntry {
                    server_id: record.server_id.clone(),
                    capabilities: record.capabilities.clone(),
                });
            }
        }
        entries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::server::{ParamType, ParameterSpec};

    fn test_config(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            port_range: (18400, 18450),
            startup_timeout: Duration::from_secs(1),
            default_call_timeout: Duration::from_secs(2),
            max_in_flight_per_server: 4,
            server_dirs: vec![],
            snapshot_path: dir.join("snapshot.json"),
        }
    }

    fn echo_capability() -> Capability {
        Capability {
            action: "echo".to_string(),
            description: "echo".to_string(),
            parameters: vec![ParameterSpec {
                name: "text".to_string(),
                param_type: ParamType::String,
                required: true,
                description: String::new(),
                default: None,
            }],
            examples: vec![],
            timeout_seconds: Some(1),
        }
    }

    fn request(server_id: &str, action: &str, params: serde_json::Value) -> InvokeRequest {
        InvokeRequest {
            task_id: Uuid::now_v7(),
            step_id: 1,
            server_id: server_id.to_string(),
            action: action.to_string(),
            parameters: params,
            deadline: Duration::from_secs(5),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_unknown_server_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(test_config(dir.path())));
        registry
            .register_endpoint(
                "calc",
                "http://127.0.0.1:1",
                ProjectType::Python,
                vec![echo_capability()],
            )
            .await
            .unwrap();

        let invocation = registry
            .invoke(request("nope", "echo", serde_json::json!({})))
            .await;
        assert_eq!(invocation.status, InvocationStatus::Unreachable);
        assert!(invocation.result.contains("calc"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(test_config(dir.path())));
        registry
            .register_endpoint("calc", "http://127.0.0.1:1", ProjectType::Python, vec![])
            .await
            .unwrap();
        let err = registry
            .register_endpoint("calc", "http://127.0.0.1:2", ProjectType::Python, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::DuplicateServer { .. }));
    }

    #[tokio::test]
    async fn test_invoke_not_ready_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(test_config(dir.path())));
        // Endpoint nothing listens on: the readiness probe cannot pass, so
        // the server sits in starting/pending and invocations fail fast.
        registry
            .register_endpoint(
                "calc",
                "http://127.0.0.1:1",
                ProjectType::Python,
                vec![echo_capability()],
            )
            .await
            .unwrap();

        let invocation = registry
            .invoke(request("calc", "echo", serde_json::json!({"text": "hi"})))
            .await;
        assert_eq!(invocation.status, InvocationStatus::Unreachable);
        assert!(invocation.result.contains("not ready"));
    }

    #[tokio::test]
    async fn test_invalid_params_never_contacts_server() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(test_config(dir.path())));
        registry
            .register_endpoint(
                "calc",
                "http://127.0.0.1:1",
                ProjectType::Python,
                vec![echo_capability()],
            )
            .await
            .unwrap();
        // Force ready so validation is the deciding layer.
        {
            let servers = registry.servers.read().await;
            servers["calc"].record.write().await.state = ServerState::Ready;
        }

        let invocation = registry
            .invoke(request("calc", "echo", serde_json::json!({"wrong": 1})))
            .await;
        assert_eq!(invocation.status, InvocationStatus::InvalidParams);
        assert!(invocation.result.contains("text"));

        let invocation = registry
            .invoke(request("calc", "bogus_action", serde_json::json!({})))
            .await;
        assert_eq!(invocation.status, InvocationStatus::InvalidParams);
        assert!(invocation.result.contains("echo"));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_preserves_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = Arc::new(ToolRegistry::new(config.clone()));
        registry
            .register_endpoint(
                "calc",
                "http://127.0.0.1:1",
                ProjectType::Python,
                vec![echo_capability()],
            )
            .await
            .unwrap();
        registry
            .register_endpoint("browse", "ws://127.0.0.1:2", ProjectType::Node, vec![])
            .await
            .unwrap();
        registry.save_snapshot().await.unwrap();
        let before = registry.servers().await;

        let restored = Arc::new(ToolRegistry::new(config));
        let count = restored.load_snapshot().await.unwrap();
        assert_eq!(count, 2);
        let after = restored.servers().await;

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.server_id, b.server_id);
            assert_eq!(a.endpoint, b.endpoint);
            assert_eq!(
                serde_json::to_value(&a.capabilities).unwrap(),
                serde_json::to_value(&b.capabilities).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_remove_unknown_server() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(test_config(dir.path())));
        assert!(matches!(
            registry.remove("ghost").await.unwrap_err(),
            ToolError::UnknownServer { .. }
        ));
    }

    #[tokio::test]
    async fn test_catalog_only_lists_ready_servers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(test_config(dir.path())));
        registry
            .register_endpoint(
                "calc",
                "http://127.0.0.1:1",
                ProjectType::Python,
                vec![echo_capability()],
            )
            .await
            .unwrap();
        assert!(registry.catalog().await.is_empty());

        {
            let servers = registry.servers.read().await;
            servers["calc"].record.write().await.state = ServerState::Ready;
        }
        let catalog = registry.catalog().await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].server_id, "calc");
        assert_eq!(catalog[0].capabilities[0].action, "echo");
    }
}
