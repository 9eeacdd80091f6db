//! Cross-task memory: sessions.
//!
//! A session is the ordered concatenation of its tasks' steps, in task
//! completion order. It is the sole mechanism for memory across tasks:
//! a task with a `session_id` gets a summarized preamble of prior steps
//! prepended to its prompt, and appends its own steps on completion.

pub mod store;
pub mod summarize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::task::Step;

pub use store::SessionStore;

/// A session's ordered step history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub steps: Vec<Step>,
}

impl Session {
    /// The empty session returned for unknown ids.
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            steps: Vec::new(),
        }
    }
}

/// A stored digest of a session prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub text: String,
    /// Number of leading steps this digest covers.
    pub covers_steps: usize,
    pub created_at: DateTime<Utc>,
}

/// Key-value style storage for sessions: ordered step-list append, atomic
/// read, and a digest slot per session.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Append one step; durable before returning.
    async fn append_step(&self, session_id: &str, step: &Step) -> Result<(), SessionError>;

    /// Read the full ordered step list. Empty for unknown sessions.
    async fn read_steps(&self, session_id: &str) -> Result<Vec<Step>, SessionError>;

    async fn read_digest(&self, session_id: &str) -> Result<Option<Digest>, SessionError>;

    async fn write_digest(&self, session_id: &str, digest: &Digest) -> Result<(), SessionError>;

    async fn delete(&self, session_id: &str) -> Result<(), SessionError>;

    /// All known sessions with their last-activity timestamps.
    async fn sessions(&self) -> Result<Vec<(String, DateTime<Utc>)>, SessionError>;
}
