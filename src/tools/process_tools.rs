//! Tools that start tracked subprocesses.
//!
//! Unlike `bash`, these return immediately: the process keeps running under
//! the process manager, optionally with callbacks that re-enter the agent.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::hooks::parse_callbacks;
use crate::process::{SpawnKind, SpawnSpec};

use super::traits::{Tool, ToolContext, ToolResult, required_str};

fn spawn_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "command": { "type": "string", "description": "Shell command to start." },
            "callbacks": {
                "type": "array",
                "description": "Hooks evaluated against the process, e.g. \
                    {\"trigger\": \"on_exit\", \"filter\": \"failure\", \
                     \"action\": \"spawn_branch\", \"instruction\": \"...\"}.",
                "items": { "type": "object" }
            },
            "context": {
                "type": "object",
                "description": "Free-form key/value context echoed into hook-spawned branches."
            }
        },
        "required": ["command"]
    })
}

async fn spawn_tracked(
    ctx: &ToolContext,
    args: &Value,
    kind: SpawnKind,
) -> Result<ToolResult, ToolError> {
    let command = required_str(args, "command")?;
    let callbacks = args
        .get("callbacks")
        .map(parse_callbacks)
        .unwrap_or_default();
    let callback_count = callbacks.len();
    let context = args.get("context").cloned().unwrap_or(json!({}));

    let row = ctx
        .processes
        .spawn(SpawnSpec {
            command: command.to_owned(),
            cwd: ctx.workspace.clone(),
            agent: ctx.agent.clone(),
            kind,
            callbacks,
            context,
            parent_branch: Some(ctx.branch_id),
            recursion_depth: ctx.recursion_depth,
        })
        .await?;

    Ok(ToolResult::ok(format!(
        "started {} process {} (`{}`); logs at {}",
        row.spawn_type, row.pid, row.command, row.stdout_log
    ))
    .with_metadata(json!({
        "pid": row.pid,
        "spawn_type": row.spawn_type,
        "callbacks": callback_count,
    })))
}

/// Start a process the current branch keeps working alongside.
pub struct RunConcurrentTool;

#[async_trait]
impl Tool for RunConcurrentTool {
    fn name(&self) -> &str {
        "run_concurrent"
    }

    fn description(&self) -> &str {
        "Start a tracked subprocess and continue immediately. Attach callbacks \
         to react to its output, exit, or runtime."
    }

    fn parameters_schema(&self) -> Value {
        spawn_schema()
    }

    fn build_detail(&self, args: &Value) -> String {
        args.get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        spawn_tracked(ctx, &args, SpawnKind::Concurrent).await
    }
}

/// Start a long-lived process surfaced with its own status embed.
pub struct RunBackgroundTool;

#[async_trait]
impl Tool for RunBackgroundTool {
    fn name(&self) -> &str {
        "run_background"
    }

    fn description(&self) -> &str {
        "Start a long-running background process with a live status message in \
         the channel. Attach callbacks to react to its output, exit, or runtime."
    }

    fn parameters_schema(&self) -> Value {
        spawn_schema()
    }

    fn build_detail(&self, args: &Value) -> String {
        args.get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        spawn_tracked(ctx, &args, SpawnKind::Background).await
    }
}
