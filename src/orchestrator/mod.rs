//! Tool orchestration: registry, process supervision, RPC routing, and the
//! capability catalog the prompt builder draws from.
//!
//! The reasoning engine depends only on the [`Invoker`] seam; everything
//! behind it (server lifecycles, transports, validation) is this module's
//! business.

pub mod install;
pub mod ports;
pub mod project;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod supervisor;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

pub use registry::ToolRegistry;
pub use server::{
    Capability, CapabilityDoc, Invocation, InvocationStatus, ParamType, ParameterSpec,
    ProjectType, ServerState, ToolServer,
};

/// One server's entry in the live capability catalog.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub server_id: String,
    pub capabilities: Vec<Capability>,
}

/// A routed capability call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub task_id: Uuid,
    /// Step id of the `tool_call` step this invocation answers.
    pub step_id: u32,
    pub server_id: String,
    pub action: String,
    pub parameters: serde_json::Value,
    /// Caller's remaining budget; the registry may shorten it further from
    /// capability metadata, never lengthen it.
    pub deadline: Duration,
    pub attempt: u32,
}

/// The engine-facing invocation seam. Implemented by [`ToolRegistry`] in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Route one capability call. Infallible by design: every failure mode
    /// is encoded in the returned invocation's status and result payload.
    async fn invoke(&self, req: InvokeRequest) -> Invocation;

    /// Snapshot of `ready` servers and their capabilities.
    async fn catalog(&self) -> Vec<CatalogEntry>;
}

/// Render a normalized error record for surfacing to the model inside a
/// `<result>` block.
pub fn error_record(kind: &str, message: &str) -> String {
    serde_json::json!({ "error": kind, "message": message }).to_string()
}
