//! The rolling context window and session snapshots.
//!
//! A window is never materialized: it is always the query "messages of this
//! agent/branch newer than `max(last_clear, now − window)`".  Clearing only
//! advances the marker; snapshots copy the current window into a
//! self-contained session file that `restore` can replay with fresh
//! timestamps.

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::ai::provider::ChatProvider;
use crate::ai::types::{ChatMessage, ChatRequest, Role, ToolCall};
use crate::branch::ExecutionBranch;
use crate::error::StoreError;
use crate::store::{AgentPaths, AgentRecord, ProcessRow, SessionRow, Store, StoredMessage};

/// Placeholder recorded when the summary model call fails or times out.
const SUMMARY_FAILED: &str = "(summary generation failed)";

/// Deadline for the snapshot summary call.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(10);

/// One message inside a session snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Branch the message belonged to, so restore replays it into the same
    /// conversation thread.
    #[serde(default)]
    pub branch: i64,
}

/// On-disk session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub summary: String,
    pub message_count: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub messages: Vec<SnapshotMessage>,
}

/// Context operations for one runtime.
pub struct ContextStore {
    store: Arc<Store>,
    home: PathBuf,
}

impl ContextStore {
    pub fn new(store: Arc<Store>, home: PathBuf) -> Self {
        Self { store, home }
    }

    /// Start of the window at `now`: the later of the clear marker and the
    /// rolling horizon.
    pub fn window_start(agent: &AgentRecord, now: DateTime<Utc>) -> DateTime<Utc> {
        let horizon = now - chrono::Duration::seconds(agent.window_seconds);
        agent.last_clear.max(horizon)
    }

    pub fn persist(&self, message: &StoredMessage) -> Result<i64, StoreError> {
        self.store.insert_message(message)
    }

    /// The branch's current window as provider messages, oldest first.
    pub fn get_window(
        &self,
        agent: &AgentRecord,
        branch: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let cutoff = Self::window_start(agent, Utc::now());
        let rows = self.store.window_messages(&agent.name, branch, cutoff)?;
        Ok(rows.iter().map(row_to_chat).collect())
    }

    /// Advance the clear marker to now.  No rows are deleted.
    pub fn clear(&self, agent: &str) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        self.store.set_last_clear(agent, now)?;
        Ok(now)
    }

    /// Copy the agent's current window (all branches) into a session file
    /// and index it.  The human-readable summary comes from a cheap model
    /// call; on failure the snapshot still saves, with a placeholder.
    pub async fn snapshot(
        &self,
        agent: &AgentRecord,
        description: &str,
        summarizer: Option<(&dyn ChatProvider, &str)>,
    ) -> Result<SessionRow, StoreError> {
        let now = Utc::now();
        let window_start = Self::window_start(agent, now);
        let rows = self.store.agent_window_messages(&agent.name, window_start)?;

        let messages: Vec<SnapshotMessage> = rows
            .iter()
            .map(|m| SnapshotMessage {
                role: m.role,
                content: m.content.clone(),
                tool_calls: m.tool_calls.clone(),
                tool_call_id: m.tool_call_id.clone(),
                timestamp: m.timestamp,
                branch: m.branch,
            })
            .collect();

        let summary = match summarizer {
            Some((provider, model)) => summarize(provider, model, &rows).await,
            None => SUMMARY_FAILED.to_owned(),
        };

        let session_id = Uuid::new_v4().to_string();
        let paths = AgentPaths::new(&self.home, &agent.name);
        std::fs::create_dir_all(paths.sessions_dir())?;
        let file_path = paths.sessions_dir().join(format!("{session_id}.json"));

        let snapshot = SessionSnapshot {
            session_id: session_id.clone(),
            timestamp: now,
            description: description.to_owned(),
            summary: summary.clone(),
            message_count: messages.len(),
            window_start,
            window_end: now,
            messages,
        };
        std::fs::write(&file_path, serde_json::to_vec_pretty(&snapshot)?)?;

        let row = SessionRow {
            session_id,
            agent: agent.name.clone(),
            timestamp: now,
            description: description.to_owned(),
            summary,
            message_count: snapshot.message_count as i64,
            file_path: file_path.to_string_lossy().into_owned(),
        };
        self.store.insert_session(&row)?;
        Ok(row)
    }

    /// Re-insert a snapshot's messages with fresh timestamps so they re-enter
    /// the rolling window.  Returns how many messages were restored.
    pub fn restore(&self, session_id: &str) -> Result<usize, StoreError> {
        let row = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| StoreError::InvalidData(format!("unknown session '{session_id}'")))?;
        let raw = std::fs::read_to_string(&row.file_path)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&raw)?;

        let base = Utc::now();
        for (i, m) in snapshot.messages.iter().enumerate() {
            // Microsecond spacing preserves the original relative order.
            let ts = base + chrono::Duration::microseconds(i as i64);
            self.store.insert_message(&StoredMessage {
                id: 0,
                agent: row.agent.clone(),
                branch: m.branch,
                role: m.role,
                content: m.content.clone(),
                tool_calls: m.tool_calls.clone(),
                tool_call_id: m.tool_call_id.clone(),
                timestamp: ts,
                outbound_message_id: None,
            })?;
        }
        Ok(snapshot.messages.len())
    }

    pub fn list_snapshots(&self, limit: usize) -> Result<Vec<SessionRow>, StoreError> {
        self.store.list_sessions(limit)
    }
}

/// Convert a stored row into its provider message.
pub fn row_to_chat(m: &StoredMessage) -> ChatMessage {
    match m.role {
        Role::User => ChatMessage::user(&m.content),
        Role::Assistant => ChatMessage::assistant(&m.content),
        Role::ToolUse => ChatMessage::tool_use(&m.content, m.tool_calls.clone()),
        Role::ToolResult => {
            ChatMessage::tool_result(m.tool_call_id.clone().unwrap_or_default(), &m.content)
        }
    }
}

/// Describe the agent's other live branches and running processes, so the
/// model knows what is already in flight.  Returns an empty string when
/// there is nothing to report.
pub fn build_preamble(
    current_branch: i64,
    branches: &[Arc<ExecutionBranch>],
    processes: &[ProcessRow],
    last_line: impl Fn(u32) -> Option<String>,
) -> String {
    let mut sections = Vec::new();

    let siblings: Vec<String> = branches
        .iter()
        .filter(|b| b.id != current_branch)
        .map(|b| {
            let step = b
                .current_step()
                .map(|s| format!(" — {s}"))
                .unwrap_or_default();
            format!(
                "- branch #{} \"{}\"{step} ({}s elapsed)",
                b.id,
                b.summary,
                b.elapsed_secs()
            )
        })
        .collect();
    if !siblings.is_empty() {
        sections.push(format!("Other active branches:\n{}", siblings.join("\n")));
    }

    let procs: Vec<String> = processes
        .iter()
        .map(|p| {
            let last = last_line(p.pid)
                .map(|l| format!(" — last output: {l}"))
                .unwrap_or_default();
            format!("- pid {} `{}`{last}", p.pid, p.command)
        })
        .collect();
    if !procs.is_empty() {
        sections.push(format!("Running processes:\n{}", procs.join("\n")));
    }

    sections.join("\n\n")
}

async fn summarize(provider: &dyn ChatProvider, model: &str, rows: &[StoredMessage]) -> String {
    if rows.is_empty() {
        return "(empty window)".to_owned();
    }
    let excerpt: String = rows
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
        .collect();
    let prompt = format!(
        "Summarize this conversation in 2-4 sentences, focusing on what was \
         accomplished and any decisions made:\n\n{excerpt}"
    );

    let request = ChatRequest::new(model, vec![ChatMessage::user(prompt)]);
    match tokio::time::timeout(SUMMARY_TIMEOUT, provider.chat(request)).await {
        Ok(Ok(response)) => response.text.unwrap_or_else(|| SUMMARY_FAILED.to_owned()),
        Ok(Err(e)) => {
            warn!(error = %e, "snapshot summary call failed");
            SUMMARY_FAILED.to_owned()
        }
        Err(_) => {
            warn!("snapshot summary call timed out");
            SUMMARY_FAILED.to_owned()
        }
    }
}
