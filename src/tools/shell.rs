//! Shell tool: runs a command in the agent workspace via the sandboxed
//! executor.  The action detail is the full command string, so profiles can
//! match on exact invocations.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::exec::{self, DEFAULT_MAX_OUTPUT, DEFAULT_TIMEOUT};

use super::traits::{Tool, ToolContext, ToolResult, required_str};

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its output. \
         Long-running work belongs in run_concurrent or run_background instead."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute." },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds before the command is killed (default 120).",
                    "minimum": 1
                }
            },
            "required": ["command"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        args.get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let command = required_str(&args, "command")?;
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(std::time::Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let outcome =
            exec::bash_execute(command, &ctx.workspace, timeout, DEFAULT_MAX_OUTPUT).await?;

        let mut output = String::new();
        if !outcome.stdout.is_empty() {
            output.push_str(&outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str("STDERR:\n");
            output.push_str(&outcome.stderr);
        }
        if outcome.timed_out {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!(
                "[command timed out after {}s]",
                timeout.as_secs()
            ));
        }

        let meta = json!({
            "exit_code": outcome.exit_code,
            "timed_out": outcome.timed_out,
            "duration_ms": outcome.duration_ms,
            "truncated": outcome.truncated,
        });
        if outcome.success() {
            Ok(ToolResult::ok(output).with_metadata(meta))
        } else {
            Ok(ToolResult::err(output).with_metadata(meta))
        }
    }
}

/// Git tool: a thin wrapper over `git <op> <args>` whose action detail is
/// `<op> <args>`, letting profiles treat publishing operations differently
/// from read-only ones.
pub struct GitTool;

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        "git"
    }

    fn description(&self) -> &str {
        "Run a git operation in the workspace repository, e.g. op=\"status\" or \
         op=\"commit\" with args=\"-m 'message'\"."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "op":   { "type": "string", "description": "Git subcommand (status, diff, commit, push, ...)." },
                "args": { "type": "string", "description": "Arguments appended after the subcommand." }
            },
            "required": ["op"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        let op = args.get("op").and_then(Value::as_str).unwrap_or_default();
        match args.get("args").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            Some(rest) => format!("{op} {rest}"),
            None => op.to_owned(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let op = required_str(&args, "op")?;
        let extra = args.get("args").and_then(Value::as_str).unwrap_or_default();
        let command = if extra.is_empty() {
            format!("git {op}")
        } else {
            format!("git {op} {extra}")
        };

        let outcome =
            exec::bash_execute(&command, &ctx.workspace, DEFAULT_TIMEOUT, DEFAULT_MAX_OUTPUT)
                .await?;

        let mut output = outcome.stdout.clone();
        if !outcome.stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&outcome.stderr);
        }

        let meta = json!({ "exit_code": outcome.exit_code, "op": op });
        if outcome.success() {
            Ok(ToolResult::ok(output).with_metadata(meta))
        } else {
            Ok(ToolResult::err(output).with_metadata(meta))
        }
    }
}
