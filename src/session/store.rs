//! Session store: backend selection, hot cache, advisory locks.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{Digest, Session, SessionBackend};
use crate::task::Step;

/// How long a worker waits for a contended session before proceeding
/// without history.
const LOCK_WAIT: Duration = Duration::from_secs(60);

/// In-process backend selected by the `memory:` endpoint scheme.
#[derive(Default)]
pub struct MemoryBackend {
    inner: tokio::sync::RwLock<HashMap<String, StoredSession>>,
}

#[derive(Default)]
struct StoredSession {
    steps: Vec<Step>,
    digest: Option<Digest>,
    last_activity: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
impl SessionBackend for MemoryBackend {
    async fn append_step(&self, session_id: &str, step: &Step) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let stored = inner.entry(session_id.to_string()).or_default();
        stored.steps.push(step.clone());
        stored.last_activity = Some(Utc::now());
        Ok(())
    }

    async fn read_steps(&self, session_id: &str) -> Result<Vec<Step>, SessionError> {
        Ok(self
            .inner
            .read()
            .await
            .get(session_id)
            .map(|s| s.steps.clone())
            .unwrap_or_default())
    }

    async fn read_digest(&self, session_id: &str) -> Result<Option<Digest>, SessionError> {
        Ok(self
            .inner
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.digest.clone()))
    }

    async fn write_digest(&self, session_id: &str, digest: &Digest) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let stored = inner.entry(session_id.to_string()).or_default();
        stored.digest = Some(digest.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.inner.write().await.remove(session_id);
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<(String, DateTime<Utc>)>, SessionError> {
        Ok(self
            .inner
            .read()
            .await
            .iter()
            .filter_map(|(id, s)| s.last_activity.map(|at| (id.clone(), at)))
            .collect())
    }
}

/// Guard proving single-writer access to one session. Dropping it releases
/// the advisory lock.
pub struct SessionGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

/// The session store: write-through LRU cache over a pluggable backend,
/// with per-session advisory locks serializing concurrent writers.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    cache: Mutex<LruCache<String, Session>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Build a store from configuration. Only the `memory:` endpoint scheme
    /// is provided by this build; other schemes are a configuration error.
    pub fn from_config(config: SessionConfig) -> Result<Self, SessionError> {
        let backend: Arc<dyn SessionBackend> = if config.endpoint.starts_with("memory:") {
            Arc::new(MemoryBackend::default())
        } else {
            return Err(SessionError::UnsupportedEndpoint {
                endpoint: config.endpoint.clone(),
            });
        };
        Ok(Self::with_backend(backend, config))
    }

    /// Build a store over an explicit backend.
    pub fn with_backend(backend: Arc<dyn SessionBackend>, config: SessionConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            cache: Mutex::new(LruCache::new(capacity)),
            locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Load a session; unknown ids yield an empty session.
    pub async fn load_session(&self, session_id: &str) -> Result<Session, SessionError> {
        if let Some(session) = self.cache.lock().await.get(session_id) {
            return Ok(session.clone());
        }
        let steps = self.backend.read_steps(session_id).await?;
        let session = Session {
            session_id: session_id.to_string(),
            steps,
        };
        self.cache
            .lock()
            .await
            .put(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Append a step; durable in the backend before the cache is touched.
    pub async fn append_step(&self, session_id: &str, step: &Step) -> Result<(), SessionError> {
        self.backend.append_step(session_id, step).await?;
        if let Some(session) = self.cache.lock().await.get_mut(session_id) {
            session.steps.push(step.clone());
        }
        Ok(())
    }

    /// Acquire the advisory write lock for a session. Waits up to 60s; on
    /// timeout the caller proceeds without history and records a warning
    /// (`session_conflict`).
    pub async fn lock_session(&self, session_id: &str) -> Result<SessionGuard, SessionError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        match tokio::time::timeout(LOCK_WAIT, lock.lock_owned()).await {
            Ok(permit) => Ok(SessionGuard { _permit: permit }),
            Err(_) => Err(SessionError::LockTimeout {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Stored digest access for the summarizer.
    pub(crate) async fn read_digest(&self, session_id: &str) -> Result<Option<Digest>, SessionError> {
        self.backend.read_digest(session_id).await
    }

    pub(crate) async fn write_digest(
        &self,
        session_id: &str,
        digest: &Digest,
    ) -> Result<(), SessionError> {
        self.backend.write_digest(session_id, digest).await
    }

    /// Produce a compact textual summary of the session fitting within
    /// `budget_tokens`, suitable for prepending to a prompt.
    pub async fn summarize(
        &self,
        session_id: &str,
        budget_tokens: usize,
    ) -> Result<String, SessionError> {
        crate::session::summarize::summarize(self, session_id, budget_tokens).await
    }

    /// Delete sessions idle for longer than `older_than`.
    pub async fn purge(&self, older_than: Duration) -> Result<usize, SessionError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let mut purged = 0;
        for (session_id, last_activity) in self.backend.sessions().await? {
            if last_activity < cutoff {
                self.backend.delete(&session_id).await?;
                self.cache.lock().await.pop(&session_id);
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "purged idle sessions");
        }
        Ok(purged)
    }
}
