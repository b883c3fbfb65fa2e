//! Row types and the on-disk layout for agent state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::types::{Role, ToolCall};
use crate::security::ProfileSpec;

// ─── Agent ──────────────────────────────────────────────────────────────────

/// One row of the `agents` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique lowercase-hyphen name.
    pub name: String,
    /// Chat channel this agent is bound to.
    pub channel_id: String,
    pub model: String,
    pub permissions: ProfileSpec,
    pub created_at: DateTime<Utc>,
    /// Messages at or before this instant are outside the context window.
    pub last_clear: DateTime<Utc>,
    /// Rolling window duration in seconds.
    pub window_seconds: i64,
    pub status: String,
}

impl AgentRecord {
    /// Agent names are `^[a-z0-9][a-z0-9-]{0,30}[a-z0-9]$`.
    pub fn valid_name(name: &str) -> bool {
        let bytes = name.as_bytes();
        if bytes.len() < 2 || bytes.len() > 32 {
            return false;
        }
        let inner_ok = bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
        let edge = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        inner_ok && edge(&bytes[0]) && edge(&bytes[bytes.len() - 1])
    }
}

// ─── Message ────────────────────────────────────────────────────────────────

/// One row of the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub agent: String,
    pub branch: i64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_message_id: Option<String>,
}

// ─── Branch / steps ─────────────────────────────────────────────────────────

/// One row of the `branches` table.
#[derive(Debug, Clone)]
pub struct BranchRow {
    pub agent: String,
    pub id: i64,
    pub status: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub parent_branch: Option<i64>,
    pub recursion_depth: u32,
}

/// One row of the `branch_steps` table.
#[derive(Debug, Clone)]
pub struct StepRow {
    pub agent: String,
    pub branch: i64,
    pub step_number: i64,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

// ─── Session / audit ────────────────────────────────────────────────────────

/// One row of the `sessions` index table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub summary: String,
    pub message_count: i64,
    pub file_path: String,
}

/// One row of the append-only `audit_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub action_string: String,
    pub decision: String,
    pub user_id: String,
    pub detail: String,
}

// ─── Process ────────────────────────────────────────────────────────────────

/// One row of the `processes` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub command: String,
    pub cwd: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    /// `"concurrent"` or `"background"`.
    pub spawn_type: String,
    pub parent_branch: Option<i64>,
    pub stdout_log: String,
    pub stderr_log: String,
    /// `"running"`, `"exited"`, `"killed"`, or `"lost"`.
    pub status: String,
    pub exit_code: Option<i32>,
    /// Serialized callback list.
    pub callbacks: Value,
    /// Free-form context supplied at spawn.
    pub context: Value,
    pub recursion_depth: u32,
    pub outbound_message_id: Option<String>,
}

// ─── Filesystem layout ──────────────────────────────────────────────────────

/// Directory layout for one agent under the runtime home:
/// `<home>/agents/<name>/{agent.toml, docs/, sessions/, workspace/}` plus
/// `<home>/agents/<name>/processes/<pid>/{stdout.log, stderr.log}`.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub root: PathBuf,
}

impl AgentPaths {
    pub fn new(home: &Path, agent: &str) -> Self {
        Self {
            root: home.join("agents").join(agent),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("agent.toml")
    }

    pub fn docs_dir(&self) -> PathBuf {
        self.root.join("docs")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn process_dir(&self, pid: u32) -> PathBuf {
        self.root.join("processes").join(pid.to_string())
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.docs_dir())?;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.workspace())?;
        Ok(())
    }

    /// Read the agent's system prompt from `agent.toml`.
    pub fn read_system_prompt(&self) -> String {
        #[derive(Deserialize, Default)]
        struct AgentFile {
            #[serde(default)]
            system_prompt: String,
        }
        std::fs::read_to_string(self.config_file())
            .ok()
            .and_then(|s| toml::from_str::<AgentFile>(&s).ok())
            .map(|f| f.system_prompt)
            .unwrap_or_default()
    }

    /// Persist a new system prompt to `agent.toml`.
    pub fn write_system_prompt(&self, prompt: &str) -> std::io::Result<()> {
        #[derive(Serialize)]
        struct AgentFile<'a> {
            system_prompt: &'a str,
        }
        std::fs::create_dir_all(&self.root)?;
        let body = toml::to_string_pretty(&AgentFile {
            system_prompt: prompt,
        })
        .map_err(std::io::Error::other)?;
        std::fs::write(self.config_file(), body)
    }

    /// Concatenate every file in the docs directory, each under a filename
    /// header.  The result is injected into the system prompt verbatim.
    pub fn read_docs(&self) -> String {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(self.docs_dir())
            .map(|rd| {
                rd.flatten()
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();

        let mut out = String::new();
        for path in entries {
            if let Ok(content) = std::fs::read_to_string(&path) {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                out.push_str(&format!("## {name}\n{content}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn valid_agent_names() {
        for ok in ["alpha", "a1", "my-agent-2", "ab"] {
            assert!(AgentRecord::valid_name(ok), "{ok} should be valid");
        }
        let too_long = "x".repeat(40);
        for bad in ["", "x", "-alpha", "alpha-", "Alpha", "a b", too_long.as_str()] {
            assert!(!AgentRecord::valid_name(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn layout_paths() {
        let p = AgentPaths::new(Path::new("/home/u/.chorus"), "alpha");
        assert!(p.workspace().ends_with("agents/alpha/workspace"));
        assert!(p.process_dir(42).ends_with("agents/alpha/processes/42"));
        assert!(p.config_file().ends_with("agents/alpha/agent.toml"));
    }

    #[test]
    fn system_prompt_round_trip() {
        let home = TempDir::new().unwrap();
        let p = AgentPaths::new(home.path(), "alpha");
        p.ensure().unwrap();
        p.write_system_prompt("You are alpha.").unwrap();
        assert_eq!(p.read_system_prompt(), "You are alpha.");
    }

    #[test]
    fn missing_prompt_is_empty() {
        let home = TempDir::new().unwrap();
        let p = AgentPaths::new(home.path(), "alpha");
        assert_eq!(p.read_system_prompt(), "");
    }

    #[test]
    fn docs_concatenated_in_name_order() {
        let home = TempDir::new().unwrap();
        let p = AgentPaths::new(home.path(), "alpha");
        p.ensure().unwrap();
        std::fs::write(p.docs_dir().join("b.md"), "second").unwrap();
        std::fs::write(p.docs_dir().join("a.md"), "first").unwrap();

        let docs = p.read_docs();
        let a = docs.find("## a.md").unwrap();
        let b = docs.find("## b.md").unwrap();
        assert!(a < b);
        assert!(docs.contains("first"));
        assert!(docs.contains("second"));
    }
}
