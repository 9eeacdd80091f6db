//! Tool server process supervision.
//!
//! One supervision task per server: launch the child process, poll
//! readiness, then keep a liveness loop running. Three consecutive liveness
//! failures demote to `degraded` (invocations fail fast), five stop the
//! server and schedule a restart with exponential backoff, bounded to five
//! attempts in a ten-minute window.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::error::ToolError;
use crate::orchestrator::registry::ServerHandle;
use crate::orchestrator::server::ServerState;

/// Readiness poll interval after launch.
const READINESS_INTERVAL: Duration = Duration::from_millis(500);
/// Liveness probe interval while ready.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failures before demotion to degraded.
const DEGRADED_THRESHOLD: u32 = 3;
/// Consecutive failures before the process is stopped.
const STOPPED_THRESHOLD: u32 = 5;
/// Restart attempts allowed within [`RESTART_WINDOW`].
const MAX_RESTARTS: usize = 5;
/// Window over which restart attempts are counted.
const RESTART_WINDOW: Duration = Duration::from_secs(600);
/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Environment variables a tool server process inherits from us. Everything
/// else is scrubbed; the server additionally gets `PORT` and `WORKING_DIR`.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "TERM"];

/// Spawn the supervision task for one server.
pub(crate) fn spawn_supervisor(
    handle: Arc<ServerHandle>,
    config: OrchestratorConfig,
    http: reqwest::Client,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        supervise(handle, config, http).await;
    })
}

async fn supervise(handle: Arc<ServerHandle>, config: OrchestratorConfig, http: reqwest::Client) {
    let server_id = handle.record.read().await.server_id.clone();
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        if handle.cancel.is_cancelled() {
            return;
        }

        // Launch (or probe an externally-managed endpoint).
        if let Err(e) = launch(&handle).await {
            tracing::error!(server = %server_id, "launch failed: {e}");
            set_state(&handle, ServerState::Failed).await;
            return;
        }

        match wait_ready(&handle, &config, &http).await {
            Ok(()) => {
                tracing::info!(server = %server_id, "tool server ready");
            }
            Err(e) => {
                tracing::error!(server = %server_id, "startup probe failed: {e}");
                set_state(&handle, ServerState::Failed).await;
                terminate(&handle).await;
                return;
            }
        }

        // Liveness loop; exits when the process dies or probes exhaust.
        let stopped_reason = liveness_loop(&handle, &http, &server_id).await;
        match stopped_reason {
            LivenessExit::Cancelled => {
                terminate(&handle).await;
                return;
            }
            LivenessExit::ProcessExited | LivenessExit::ProbesExhausted => {
                set_state(&handle, ServerState::Stopped).await;
                terminate(&handle).await;
                *handle.ws.lock().await = None;

                // Restart budget check.
                let now = Instant::now();
                while let Some(front) = restarts.front() {
                    if now.duration_since(*front) > RESTART_WINDOW {
                        restarts.pop_front();
                    } else {
                        break;
                    }
                }
                if restarts.len() >= MAX_RESTARTS {
                    tracing::error!(
                        server = %server_id,
                        "restart budget exhausted ({MAX_RESTARTS} in {RESTART_WINDOW:?})"
                    );
                    set_state(&handle, ServerState::Failed).await;
                    return;
                }
                let backoff = Duration::from_secs(1 << restarts.len().min(5));
                restarts.push_back(now);
                tracing::warn!(server = %server_id, "restarting in {backoff:?}");

                tokio::select! {
                    _ = handle.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

enum LivenessExit {
    Cancelled,
    ProcessExited,
    ProbesExhausted,
}

async fn liveness_loop(
    handle: &Arc<ServerHandle>,
    http: &reqwest::Client,
    server_id: &str,
) -> LivenessExit {
    let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // skip the immediate tick; readiness just passed

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => return LivenessExit::Cancelled,
            _ = wait_process_exit(handle) => {
                tracing::warn!(server = %server_id, "tool server process exited");
                return LivenessExit::ProcessExited;
            }
            _ = ticker.tick() => {
                let endpoint = handle.record.read().await.endpoint.clone();
                let healthy = probe(http, &endpoint).await.is_ok();
                let mut record = handle.record.write().await;
                if healthy {
                    record.consecutive_failures = 0;
                    record.last_health_check = Some(Utc::now());
                    if record.state == ServerState::Degraded {
                        tracing::info!(server = %server_id, "recovered from degraded");
                        record.state = ServerState::Ready;
                    }
                } else {
                    record.consecutive_failures += 1;
                    let failures = record.consecutive_failures;
                    if failures >= STOPPED_THRESHOLD {
                        tracing::error!(server = %server_id, failures, "stopping unhealthy server");
                        return LivenessExit::ProbesExhausted;
                    }
                    if failures >= DEGRADED_THRESHOLD && record.state == ServerState::Ready {
                        tracing::warn!(server = %server_id, failures, "demoting to degraded");
                        record.state = ServerState::Degraded;
                    }
                }
            }
        }
    }
}

/// Resolve only when the supervised process has exited. Externally managed
/// endpoints have no child to watch, so this never resolves for them and
/// supervision is probe-only.
async fn wait_process_exit(handle: &Arc<ServerHandle>) {
    // The process mutex is held only long enough to poll; `Child::wait`
    // would hold it across the await and block `terminate`.
    loop {
        {
            let mut process = handle.process.lock().await;
            if let Some(child) = process.as_mut() {
                match child.try_wait() {
                    Ok(Some(_status)) => {
                        *process = None;
                        return;
                    }
                    Ok(None) => {}
                    Err(_) => return,
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Launch the server's process, if it has a launch command.
async fn launch(handle: &Arc<ServerHandle>) -> Result<(), ToolError> {
    let (server_id, launch_command, working_dir, port) = {
        let mut record = handle.record.write().await;
        record.state = ServerState::Starting;
        record.consecutive_failures = 0;
        (
            record.server_id.clone(),
            record.launch_command.clone(),
            record.working_dir.clone(),
            record.allocated_port,
        )
    };

    let Some(command) = launch_command else {
        // Externally managed endpoint: nothing to spawn, probe-only.
        return Ok(());
    };
    let Some((program, args)) = command.split_first() else {
        return Err(ToolError::LaunchFailed {
            server_id,
            reason: "empty launch command".to_string(),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&working_dir)
        .env_clear()
        .envs(
            ENV_ALLOWLIST
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v))),
        )
        .env("PORT", port.to_string())
        .env("WORKING_DIR", working_dir.display().to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ToolError::LaunchFailed {
        server_id: server_id.clone(),
        reason: e.to_string(),
    })?;

    if let Some(stdout) = child.stdout.take() {
        pipe_output(server_id.clone(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        pipe_output(server_id.clone(), "stderr", stderr);
    }

    {
        let mut record = handle.record.write().await;
        record.pid = child.id();
    }
    *handle.process.lock().await = Some(child);
    Ok(())
}

fn pipe_output<R>(server_id: String, channel: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "tool_server", server = %server_id, channel, "{line}");
        }
    });
}

/// Poll the readiness probe until it passes or the startup budget runs out.
async fn wait_ready(
    handle: &Arc<ServerHandle>,
    config: &OrchestratorConfig,
    http: &reqwest::Client,
) -> Result<(), ToolError> {
    let (server_id, endpoint) = {
        let record = handle.record.read().await;
        (record.server_id.clone(), record.endpoint.clone())
    };

    let started = Instant::now();
    while started.elapsed() < config.startup_timeout {
        if handle.cancel.is_cancelled() {
            return Err(ToolError::LaunchFailed {
                server_id,
                reason: "cancelled during startup".to_string(),
            });
        }

        // A dead child will never become ready; fail early.
        {
            let mut process = handle.process.lock().await;
            if let Some(child) = process.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                *process = None;
                return Err(ToolError::LaunchFailed {
                    server_id,
                    reason: format!("process exited during startup: {status}"),
                });
            }
        }

        if probe(http, &endpoint).await.is_ok() {
            let mut record = handle.record.write().await;
            record.state = ServerState::Ready;
            record.consecutive_failures = 0;
            record.last_health_check = Some(Utc::now());
            return Ok(());
        }
        tokio::time::sleep(READINESS_INTERVAL).await;
    }

    Err(ToolError::LaunchFailed {
        server_id,
        reason: format!("no successful health check within {:?}", config.startup_timeout),
    })
}

/// One readiness/liveness check: HTTP `GET /health`, or a WebSocket
/// handshake for `ws://` endpoints.
pub(crate) async fn probe(http: &reqwest::Client, endpoint: &str) -> Result<(), String> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        let (stream, _response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| e.to_string())?;
        drop(stream);
        return Ok(());
    }

    let url = format!("{}/health", endpoint.trim_end_matches('/'));
    let response = http
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("health returned {}", response.status()));
    }
    // `{status: "ok", version, capabilities_digest}`; tolerate servers that
    // return a bare 200.
    if let Ok(body) = response.json::<serde_json::Value>().await
        && let Some(status) = body.get("status").and_then(|s| s.as_str())
        && status != "ok"
    {
        return Err(format!("health status '{status}'"));
    }
    Ok(())
}

/// Stop the server process: SIGTERM, grace period, then SIGKILL.
pub(crate) async fn terminate(handle: &Arc<ServerHandle>) {
    let child = handle.process.lock().await.take();
    let Some(mut child) = child else {
        return;
    };

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn set_state(handle: &Arc<ServerHandle>, state: ServerState) {
    handle.record.write().await.state = state;
}
