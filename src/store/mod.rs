//! SQLite-backed persistence: schema plus a narrow DAO.
//!
//! One write-capable connection is opened per runtime and shared behind a
//! mutex; SQLite serializes writes internally and every operation here is a
//! short statement.  Timestamps are stored as microseconds since the epoch
//! so range queries stay index-friendly.

pub mod models;

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::ai::types::{Role, ToolCall};
use crate::error::StoreError;
use crate::security::ProfileSpec;

pub use models::{
    AgentPaths, AgentRecord, AuditRecord, BranchRow, ProcessRow, SessionRow, StepRow,
    StoredMessage,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    name            TEXT PRIMARY KEY,
    channel_id      TEXT NOT NULL,
    model           TEXT NOT NULL,
    permissions     TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    last_clear_time INTEGER NOT NULL,
    window_seconds  INTEGER NOT NULL,
    status          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    agent               TEXT NOT NULL,
    branch              INTEGER NOT NULL,
    role                TEXT NOT NULL,
    content             TEXT NOT NULL,
    tool_calls          TEXT,
    tool_call_id        TEXT,
    timestamp           INTEGER NOT NULL,
    outbound_message_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_agent_ts ON messages(agent, timestamp);
CREATE TABLE IF NOT EXISTS branches (
    agent           TEXT NOT NULL,
    id              INTEGER NOT NULL,
    status          TEXT NOT NULL,
    summary         TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    parent_branch   INTEGER,
    recursion_depth INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (agent, id)
);
CREATE TABLE IF NOT EXISTS branch_steps (
    agent       TEXT NOT NULL,
    branch      INTEGER NOT NULL,
    step_number INTEGER NOT NULL,
    description TEXT NOT NULL,
    started_at  INTEGER NOT NULL,
    ended_at    INTEGER,
    duration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_steps_agent_branch ON branch_steps(agent, branch);
CREATE TABLE IF NOT EXISTS sessions (
    session_id    TEXT PRIMARY KEY,
    agent         TEXT NOT NULL,
    timestamp     INTEGER NOT NULL,
    description   TEXT NOT NULL,
    summary       TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    file_path     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp     INTEGER NOT NULL,
    agent         TEXT NOT NULL,
    action_string TEXT NOT NULL,
    decision      TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    detail        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS processes (
    pid                 INTEGER PRIMARY KEY,
    command             TEXT NOT NULL,
    cwd                 TEXT NOT NULL,
    agent               TEXT NOT NULL,
    started_at          INTEGER NOT NULL,
    type                TEXT NOT NULL,
    parent_branch       INTEGER,
    stdout_log          TEXT NOT NULL,
    stderr_log          TEXT NOT NULL,
    status              TEXT NOT NULL,
    exit_code           INTEGER,
    callbacks           TEXT NOT NULL,
    context             TEXT NOT NULL,
    recursion_depth     INTEGER NOT NULL DEFAULT 0,
    outbound_message_id TEXT
);
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// The runtime's persistent store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database under `<home>/db/chorus.db`.
    pub fn open(home: &Path) -> Result<Self, StoreError> {
        let db_dir = home.join("db");
        std::fs::create_dir_all(&db_dir)
            .map_err(|e| StoreError::Init(format!("failed to create {db_dir:?}: {e}")))?;
        let path = db_dir.join("chorus.db");
        info!(path = %path.display(), "opening store");
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    // ── Agents ──────────────────────────────────────────────────────────

    pub fn upsert_agent(&self, a: &AgentRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO agents (name, channel_id, model, permissions, created_at,
                                 last_clear_time, window_seconds, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                 channel_id = ?2, model = ?3, permissions = ?4,
                 last_clear_time = ?6, window_seconds = ?7, status = ?8",
            params![
                a.name,
                a.channel_id,
                a.model,
                serde_json::to_string(&a.permissions)?,
                micros(a.created_at),
                micros(a.last_clear),
                a.window_seconds,
                a.status,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        self.conn()
            .query_row(
                "SELECT name, channel_id, model, permissions, created_at,
                        last_clear_time, window_seconds, status
                 FROM agents WHERE name = ?1",
                params![name],
                row_to_agent,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn agent_for_channel(&self, channel_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        self.conn()
            .query_row(
                "SELECT name, channel_id, model, permissions, created_at,
                        last_clear_time, window_seconds, status
                 FROM agents WHERE channel_id = ?1",
                params![channel_id],
                row_to_agent,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, channel_id, model, permissions, created_at,
                    last_clear_time, window_seconds, status
             FROM agents ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], row_to_agent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Advance the clear marker; message rows are never deleted.
    pub fn set_last_clear(&self, agent: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE agents SET last_clear_time = ?2 WHERE name = ?1",
            params![agent, micros(at)],
        )?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────────

    pub fn insert_message(&self, m: &StoredMessage) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (agent, branch, role, content, tool_calls,
                                   tool_call_id, timestamp, outbound_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                m.agent,
                m.branch,
                m.role.as_str(),
                m.content,
                if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&m.tool_calls)?)
                },
                m.tool_call_id,
                micros(m.timestamp),
                m.outbound_message_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Messages for `agent`/`branch` strictly newer than `after`, ascending.
    pub fn window_messages(
        &self,
        agent: &str,
        branch: i64,
        after: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, agent, branch, role, content, tool_calls, tool_call_id,
                    timestamp, outbound_message_id
             FROM messages
             WHERE agent = ?1 AND branch = ?2 AND timestamp > ?3
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![agent, branch, micros(after)], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Messages for `agent` across all branches newer than `after`, ascending.
    pub fn agent_window_messages(
        &self,
        agent: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, agent, branch, role, content, tool_calls, tool_call_id,
                    timestamp, outbound_message_id
             FROM messages
             WHERE agent = ?1 AND timestamp > ?2
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![agent, micros(after)], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn message_count(&self, agent: &str) -> Result<i64, StoreError> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE agent = ?1",
                params![agent],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    // ── Branches / steps ────────────────────────────────────────────────

    pub fn upsert_branch(&self, b: &BranchRow) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO branches (agent, id, status, summary, created_at,
                                   parent_branch, recursion_depth)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(agent, id) DO UPDATE SET status = ?3, summary = ?4",
            params![
                b.agent,
                b.id,
                b.status,
                b.summary,
                micros(b.created_at),
                b.parent_branch,
                b.recursion_depth,
            ],
        )?;
        Ok(())
    }

    pub fn update_branch_status(
        &self,
        agent: &str,
        branch: i64,
        status: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE branches SET status = ?3 WHERE agent = ?1 AND id = ?2",
            params![agent, branch, status],
        )?;
        Ok(())
    }

    pub fn max_branch_id(&self, agent: &str) -> Result<i64, StoreError> {
        self.conn()
            .query_row(
                "SELECT COALESCE(MAX(id), 0) FROM branches WHERE agent = ?1",
                params![agent],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    pub fn insert_step(&self, s: &StepRow) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO branch_steps (agent, branch, step_number, description,
                                       started_at, ended_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                s.agent,
                s.branch,
                s.step_number,
                s.description,
                micros(s.started_at),
                s.ended_at.map(micros),
                s.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn steps_for_branch(&self, agent: &str, branch: i64) -> Result<Vec<StepRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT agent, branch, step_number, description, started_at, ended_at, duration_ms
             FROM branch_steps WHERE agent = ?1 AND branch = ?2 ORDER BY step_number",
        )?;
        let rows = stmt
            .query_map(params![agent, branch], |r| {
                Ok(StepRow {
                    agent: r.get(0)?,
                    branch: r.get(1)?,
                    step_number: r.get(2)?,
                    description: r.get(3)?,
                    started_at: from_micros(r.get(4)?),
                    ended_at: r.get::<_, Option<i64>>(5)?.map(from_micros),
                    duration_ms: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn insert_session(&self, s: &SessionRow) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sessions (session_id, agent, timestamp, description,
                                   summary, message_count, file_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                s.session_id,
                s.agent,
                micros(s.timestamp),
                s.description,
                s.summary,
                s.message_count,
                s.file_path,
            ],
        )?;
        Ok(())
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, agent, timestamp, description, summary, message_count, file_path
             FROM sessions ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(SessionRow {
                    session_id: r.get(0)?,
                    agent: r.get(1)?,
                    timestamp: from_micros(r.get(2)?),
                    description: r.get(3)?,
                    summary: r.get(4)?,
                    message_count: r.get(5)?,
                    file_path: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, StoreError> {
        self.conn()
            .query_row(
                "SELECT session_id, agent, timestamp, description, summary, message_count, file_path
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |r| {
                    Ok(SessionRow {
                        session_id: r.get(0)?,
                        agent: r.get(1)?,
                        timestamp: from_micros(r.get(2)?),
                        description: r.get(3)?,
                        summary: r.get(4)?,
                        message_count: r.get(5)?,
                        file_path: r.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    // ── Audit ───────────────────────────────────────────────────────────

    pub fn append_audit(
        &self,
        agent: &str,
        action_string: &str,
        decision: &str,
        user_id: &str,
        detail: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO audit_log (timestamp, agent, action_string, decision, user_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                micros(Utc::now()),
                agent,
                action_string,
                decision,
                user_id,
                detail,
            ],
        )?;
        Ok(())
    }

    pub fn audit_tail(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, agent, action_string, decision, user_id, detail
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(AuditRecord {
                    id: r.get(0)?,
                    timestamp: from_micros(r.get(1)?),
                    agent: r.get(2)?,
                    action_string: r.get(3)?,
                    decision: r.get(4)?,
                    user_id: r.get(5)?,
                    detail: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Processes ───────────────────────────────────────────────────────

    pub fn upsert_process(&self, p: &ProcessRow) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO processes (pid, command, cwd, agent, started_at, type,
                                    parent_branch, stdout_log, stderr_log, status,
                                    exit_code, callbacks, context, recursion_depth,
                                    outbound_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(pid) DO UPDATE SET
                 status = ?10, exit_code = ?11, outbound_message_id = ?15",
            params![
                p.pid,
                p.command,
                p.cwd,
                p.agent,
                micros(p.started_at),
                p.spawn_type,
                p.parent_branch,
                p.stdout_log,
                p.stderr_log,
                p.status,
                p.exit_code,
                serde_json::to_string(&p.callbacks)?,
                serde_json::to_string(&p.context)?,
                p.recursion_depth,
                p.outbound_message_id,
            ],
        )?;
        Ok(())
    }

    pub fn update_process_exit(
        &self,
        pid: u32,
        status: &str,
        exit_code: Option<i32>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE processes SET status = ?2, exit_code = ?3 WHERE pid = ?1",
            params![pid, status, exit_code],
        )?;
        Ok(())
    }

    pub fn get_process(&self, pid: u32) -> Result<Option<ProcessRow>, StoreError> {
        self.conn()
            .query_row(
                "SELECT pid, command, cwd, agent, started_at, type, parent_branch,
                        stdout_log, stderr_log, status, exit_code, callbacks, context,
                        recursion_depth, outbound_message_id
                 FROM processes WHERE pid = ?1",
                params![pid],
                row_to_process,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Processes filtered by agent (all agents when `None`).
    pub fn list_processes(&self, agent: Option<&str>) -> Result<Vec<ProcessRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT pid, command, cwd, agent, started_at, type, parent_branch,
                    stdout_log, stderr_log, status, exit_code, callbacks, context,
                    recursion_depth, outbound_message_id
             FROM processes
             WHERE (?1 IS NULL OR agent = ?1)
             ORDER BY started_at DESC",
        )?;
        let rows = stmt
            .query_map(params![agent], row_to_process)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn running_processes(&self) -> Result<Vec<ProcessRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT pid, command, cwd, agent, started_at, type, parent_branch,
                    stdout_log, stderr_log, status, exit_code, callbacks, context,
                    recursion_depth, outbound_message_id
             FROM processes WHERE status = 'running'",
        )?;
        let rows = stmt
            .query_map([], row_to_process)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }
}

// ─── Row mappers ────────────────────────────────────────────────────────────

fn micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us).single().unwrap_or_default()
}

fn row_to_agent(r: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let permissions: String = r.get(3)?;
    Ok(AgentRecord {
        name: r.get(0)?,
        channel_id: r.get(1)?,
        model: r.get(2)?,
        permissions: serde_json::from_str::<ProfileSpec>(&permissions)
            .unwrap_or(ProfileSpec::Preset("locked".to_owned())),
        created_at: from_micros(r.get(4)?),
        last_clear: from_micros(r.get(5)?),
        window_seconds: r.get(6)?,
        status: r.get(7)?,
    })
}

fn row_to_message(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = r.get(3)?;
    let tool_calls: Option<String> = r.get(5)?;
    Ok(StoredMessage {
        id: r.get(0)?,
        agent: r.get(1)?,
        branch: r.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        content: r.get(4)?,
        tool_calls: tool_calls
            .and_then(|s| serde_json::from_str::<Vec<ToolCall>>(&s).ok())
            .unwrap_or_default(),
        tool_call_id: r.get(6)?,
        timestamp: from_micros(r.get(7)?),
        outbound_message_id: r.get(8)?,
    })
}

fn row_to_process(r: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessRow> {
    let callbacks: String = r.get(11)?;
    let context: String = r.get(12)?;
    Ok(ProcessRow {
        pid: r.get(0)?,
        command: r.get(1)?,
        cwd: r.get(2)?,
        agent: r.get(3)?,
        started_at: from_micros(r.get(4)?),
        spawn_type: r.get(5)?,
        parent_branch: r.get(6)?,
        stdout_log: r.get(7)?,
        stderr_log: r.get(8)?,
        status: r.get(9)?,
        exit_code: r.get(10)?,
        callbacks: serde_json::from_str(&callbacks).unwrap_or(serde_json::Value::Null),
        context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
        recursion_depth: r.get(13)?,
        outbound_message_id: r.get(14)?,
    })
}
