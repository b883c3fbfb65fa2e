//! The `Tool` seam between the loop and everything a tool can touch.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::branch::{BranchManager, ExecutionBranch};
use crate::error::ToolError;
use crate::orchestrator::OrchestratorRequest;
use crate::process::ProcessManager;
use crate::store::{AgentRecord, Store};

/// The result of executing a [`Tool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Human-readable output (file snippet, command output, etc.).
    pub output: String,
    /// Whether the tool considered the execution successful.
    pub success: bool,
    /// Optional structured metadata for machine consumption.
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Identity of the human whose message seeded the current branch.
#[derive(Debug, Clone, Default)]
pub struct InvokingUser {
    pub id: String,
    pub roles: Vec<String>,
}

/// Everything a tool may touch during execution.
///
/// One context is built per branch run; tools receive a shared reference for
/// each call.  Mutable agent state (model, prompt, profile) sits behind a
/// lock so self-edits land without tearing down the loop.
#[derive(Clone)]
pub struct ToolContext {
    pub agent: String,
    pub branch_id: i64,
    /// Runtime home (the parent of `agents/<name>/...`).
    pub home: PathBuf,
    /// Canonical workspace root for this agent.
    pub workspace: PathBuf,
    /// The agent's branch manager; file write locks are acquired through it.
    pub manager: Arc<BranchManager>,
    pub lock_timeout: Duration,
    pub store: Arc<Store>,
    pub processes: Arc<ProcessManager>,
    /// Calls back into the orchestrator (inter-agent messaging, spawns).
    pub requests: mpsc::Sender<OrchestratorRequest>,
    /// Live agent record; self-edit tools mutate and persist it.
    pub agent_state: Arc<std::sync::RwLock<AgentRecord>>,
    pub invoking_user: InvokingUser,
    /// Roles allowed to approve permission-profile changes.
    pub granter_roles: Vec<String>,
    /// Hook recursion depth the current branch runs at.
    pub recursion_depth: u32,
    /// The branch this context runs under, when one exists, so tools can
    /// report progress steps (e.g. waiting on a file lock).
    pub branch: Option<Arc<ExecutionBranch>>,
}

impl ToolContext {
    /// Record a progress step against the owning branch, if any.
    pub fn note_step(&self, description: impl Into<String>) {
        if let Some(branch) = &self.branch {
            branch.begin_step(description);
        }
    }
}

/// A capability the loop can invoke.
///
/// Implementations must be `Send + Sync` so they can be held in a shared
/// `Arc<dyn Tool>` registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"str_replace"`.
    fn name(&self) -> &str;

    /// Human-readable description used in provider tool definitions.
    fn description(&self) -> &str;

    /// JSON Schema object describing the accepted parameters.
    fn parameters_schema(&self) -> Value;

    /// The `<detail>` part of this call's action string, derived from the
    /// arguments before any execution happens.
    fn build_detail(&self, args: &Value) -> String;

    /// Execute the tool.  Kind-tagged failures are rendered into the
    /// conversation; the loop continues either way.
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError>;
}

/// Pull a required string argument.
pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| {
        ToolError::new(
            crate::error::ErrorKind::InvalidArguments,
            format!("missing required argument '{key}'"),
        )
    })
}
