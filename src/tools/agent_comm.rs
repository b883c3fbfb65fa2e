//! Inter-agent tools, implemented as calls back into the orchestrator.
//!
//! `send` enqueues a seed message into the target agent's own routing path:
//! the target runs it as a fresh branch under its own permission profile,
//! never the sender's.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::error::{ErrorKind, ToolError};
use crate::orchestrator::OrchestratorRequest;

use super::traits::{Tool, ToolContext, ToolResult, required_str};

/// How long to wait for the orchestrator to answer a comm request.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentCommTool;

#[async_trait]
impl Tool for AgentCommTool {
    fn name(&self) -> &str {
        "agent_comm"
    }

    fn description(&self) -> &str {
        "Interact with other agents: op=\"send\" delivers a message that the \
         target agent handles as its own task, op=\"read_docs\" returns a \
         target agent's documents, op=\"list\" names all agents."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "op":      { "type": "string", "enum": ["send", "read_docs", "list"] },
                "target":  { "type": "string", "description": "Target agent name (send, read_docs)." },
                "message": { "type": "string", "description": "Message to deliver (send)." }
            },
            "required": ["op"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        let op = args.get("op").and_then(Value::as_str).unwrap_or_default();
        match args.get("target").and_then(Value::as_str) {
            Some(target) if !target.is_empty() => format!("{op} {target}"),
            _ => op.to_owned(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let op = required_str(&args, "op")?;
        match op {
            "send" => {
                let target = required_str(&args, "target")?;
                let message = required_str(&args, "message")?;
                let (reply, rx) = oneshot::channel();
                self.submit(
                    ctx,
                    OrchestratorRequest::SendToAgent {
                        from: ctx.agent.clone(),
                        target: target.to_owned(),
                        message: message.to_owned(),
                        reply,
                    },
                )
                .await?;
                await_reply(rx)
                    .await?
                    .map_err(|e| ToolError::new(ErrorKind::InvalidArguments, e))?;
                Ok(ToolResult::ok(format!(
                    "message delivered to {target}; it will handle it as a new task"
                )))
            }
            "read_docs" => {
                let target = required_str(&args, "target")?;
                let (reply, rx) = oneshot::channel();
                self.submit(
                    ctx,
                    OrchestratorRequest::ReadAgentDocs {
                        target: target.to_owned(),
                        reply,
                    },
                )
                .await?;
                let docs = await_reply(rx)
                    .await?
                    .map_err(|e| ToolError::new(ErrorKind::InvalidArguments, e))?;
                Ok(ToolResult::ok(if docs.is_empty() {
                    format!("{target} has no documents")
                } else {
                    docs
                }))
            }
            "list" => {
                let (reply, rx) = oneshot::channel();
                self.submit(ctx, OrchestratorRequest::ListAgents { reply })
                    .await?;
                let agents = await_reply(rx).await?;
                Ok(ToolResult::ok(agents.join("\n"))
                    .with_metadata(json!({ "count": agents.len() })))
            }
            other => Err(ToolError::new(
                ErrorKind::InvalidArguments,
                format!("unknown agent_comm op '{other}'"),
            )),
        }
    }
}

impl AgentCommTool {
    async fn submit(&self, ctx: &ToolContext, request: OrchestratorRequest) -> Result<(), ToolError> {
        ctx.requests.send(request).await.map_err(|_| {
            ToolError::new(ErrorKind::InvalidArguments, "orchestrator is not running")
        })
    }
}

async fn await_reply<T>(rx: oneshot::Receiver<T>) -> Result<T, ToolError> {
    tokio::time::timeout(REPLY_TIMEOUT, rx)
        .await
        .map_err(|_| ToolError::new(ErrorKind::InvalidArguments, "orchestrator reply timed out"))?
        .map_err(|_| ToolError::new(ErrorKind::InvalidArguments, "orchestrator dropped the request"))
}
