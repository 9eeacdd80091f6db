//! stride, an agent execution platform.
//!
//! Accepts natural-language tasks, drives an LLM through a stop-and-wait
//! reason→act loop, executes the model's tool calls against a supervised
//! fleet of out-of-process tool servers, and records a complete
//! step-by-step trajectory of every run.
//!
//! The three load-bearing subsystems:
//!
//! - [`engine`]: the reasoning loop: streamed generation with stop
//!   sequences, first-tool-call interception, hallucinated-result defense,
//!   real-result injection.
//! - [`orchestrator`]: the tool layer: server registry, process
//!   supervision with health probes, WebSocket/HTTP RPC routing, and the
//!   live capability catalog.
//! - [`dispatch`]: the task fabric: ordered per-type queue streams with
//!   lease/re-delivery semantics and a worker pool.
//!
//! Supporting cast: [`session`] (cross-task memory with summarization),
//! [`trajectory`] (durable ndjson step logs plus crash recovery),
//! [`codec`] (prompt construction and the streaming response parser),
//! [`llm`] (the streaming provider seam).

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod platform;
pub mod session;
pub mod task;
pub mod trajectory;

pub use config::Config;
pub use error::Error;
pub use platform::Platform;
pub use task::{Task, TaskType};
