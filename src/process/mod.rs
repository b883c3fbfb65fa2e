//! Tracked long-running subprocesses.
//!
//! Every spawned process gets per-pid log files, a bounded tail ring, and an
//! output monitor task that feeds the hook engine.  Rows are persisted as
//! `running` immediately so a host restart can find and re-adopt them.
//!
//! Killing is signal-based (`kill`, then `kill -9` after a grace period)
//! rather than handle-based, so the same path works for re-adopted processes
//! the runtime no longer holds a child handle for.

pub mod monitor;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{ErrorKind, StoreError, ToolError};
use crate::exec::{pid_alive, sigterm};
use crate::hooks::{CallbackSpec, HookEffect, HookEngine};
use crate::store::{AgentPaths, ProcessRow, Store};

/// Lines kept in each process's rolling output tail.
pub const TAIL_CAPACITY: usize = 100;

/// Grace between SIGTERM and SIGKILL when stopping a process.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How a spawn relates to its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnKind {
    /// The spawning branch continues immediately.
    Concurrent,
    /// Like concurrent, but surfaced as a live status embed in the channel.
    Background,
}

impl SpawnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrent => "concurrent",
            Self::Background => "background",
        }
    }
}

/// Everything needed to start a tracked process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub agent: String,
    pub kind: SpawnKind,
    pub callbacks: Vec<CallbackSpec>,
    /// Free-form key/value context attached at spawn, echoed into any
    /// hook-spawned branch seed.
    pub context: Value,
    pub parent_branch: Option<i64>,
    pub recursion_depth: u32,
}

/// Process-wide manager owning all tracked subprocesses.
pub struct ProcessManager {
    store: Arc<Store>,
    home: PathBuf,
    effects: mpsc::Sender<HookEffect>,
    /// Rolling output tails, shared with monitors.
    tails: Arc<Mutex<HashMap<u32, VecDeque<String>>>>,
    /// Pids with a kill in progress, so the monitor records `killed` rather
    /// than `exited`.
    kill_requested: Arc<Mutex<HashSet<u32>>>,
    monitors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ProcessManager {
    pub fn new(store: Arc<Store>, home: PathBuf, effects: mpsc::Sender<HookEffect>) -> Self {
        Self {
            store,
            home,
            effects,
            tails: Arc::new(Mutex::new(HashMap::new())),
            kill_requested: Arc::new(Mutex::new(HashSet::new())),
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a subprocess, persist it, and start its output monitor.
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessRow, ToolError> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ToolError::new(ErrorKind::CommandTimeout, format!("failed to spawn: {e}"))
            })?;
        let pid = child.id().ok_or_else(|| {
            ToolError::new(ErrorKind::CommandTimeout, "spawned process has no pid")
        })?;

        let log_dir = AgentPaths::new(&self.home, &spec.agent).process_dir(pid);
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            ToolError::new(ErrorKind::CommandTimeout, format!("cannot create log dir: {e}"))
        })?;
        let stdout_log = log_dir.join("stdout.log");
        let stderr_log = log_dir.join("stderr.log");

        let row = ProcessRow {
            pid,
            command: spec.command.clone(),
            cwd: spec.cwd.to_string_lossy().into_owned(),
            agent: spec.agent.clone(),
            started_at: Utc::now(),
            spawn_type: spec.kind.as_str().to_owned(),
            parent_branch: spec.parent_branch,
            stdout_log: stdout_log.to_string_lossy().into_owned(),
            stderr_log: stderr_log.to_string_lossy().into_owned(),
            status: "running".to_owned(),
            exit_code: None,
            callbacks: serde_json::to_value(&spec.callbacks).unwrap_or(Value::Null),
            context: spec.context.clone(),
            recursion_depth: spec.recursion_depth,
            outbound_message_id: None,
        };
        self.store
            .upsert_process(&row)
            .map_err(store_to_tool_error)?;

        self.tails
            .lock()
            .expect("tail map poisoned")
            .insert(pid, VecDeque::with_capacity(TAIL_CAPACITY));

        info!(pid, agent = %spec.agent, command = %spec.command, "tracked process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let handle = tokio::spawn(monitor::run_monitor(monitor::MonitorArgs {
            pid,
            child: Some(child),
            stdout,
            stderr,
            stdout_log,
            stderr_log,
            engine: HookEngine::new(spec.callbacks, std::time::Instant::now()),
            effects: self.effects.clone(),
            store: Arc::clone(&self.store),
            tails: Arc::clone(&self.tails),
            kill_requested: Arc::clone(&self.kill_requested),
            row,
        }));
        self.monitors.lock().expect("monitor list poisoned").push(handle);

        // The persisted row is what callers see.
        self.store
            .get_process(pid)
            .map_err(store_to_tool_error)?
            .ok_or_else(|| ToolError::new(ErrorKind::CommandTimeout, "process row vanished"))
    }

    /// Two-phase stop: SIGTERM, grace period, SIGKILL.  The monitor records
    /// the terminal status.
    pub async fn kill(&self, pid: u32) -> Result<(), ToolError> {
        let row = self
            .store
            .get_process(pid)
            .map_err(store_to_tool_error)?
            .ok_or_else(|| {
                ToolError::new(ErrorKind::InvalidArguments, format!("unknown pid {pid}"))
            })?;
        if row.status != "running" {
            return Ok(());
        }

        self.kill_requested
            .lock()
            .expect("kill set poisoned")
            .insert(pid);
        sigterm(pid);

        let grace = KILL_GRACE;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if pid_alive(pid) {
                #[cfg(unix)]
                {
                    let _ = std::process::Command::new("kill")
                        .args(["-9", &pid.to_string()])
                        .status();
                }
            }
        });
        Ok(())
    }

    pub fn get(&self, pid: u32) -> Result<Option<ProcessRow>, StoreError> {
        self.store.get_process(pid)
    }

    pub fn list(&self, agent: Option<&str>) -> Result<Vec<ProcessRow>, StoreError> {
        self.store.list_processes(agent)
    }

    /// Last output lines (bounded by the tail ring).
    pub fn tail(&self, pid: u32) -> Vec<String> {
        self.tails
            .lock()
            .expect("tail map poisoned")
            .get(&pid)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows still marked running, for the context preamble.
    pub fn running(&self) -> Vec<ProcessRow> {
        self.store.running_processes().unwrap_or_default()
    }

    /// Re-adopt or settle processes persisted as running by a previous run.
    ///
    /// Alive pids get a poll-based monitor (liveness probe + log offsets);
    /// dead pids are marked `lost` — their exit code is unknowable — and
    /// their exit callbacks fire now, so work queued behind a process that
    /// died while the host was down still happens.
    pub fn recover_on_startup(&self) -> Result<usize, StoreError> {
        let rows = self.store.running_processes()?;
        let mut recovered = 0;
        for row in rows {
            if pid_alive(row.pid) {
                info!(pid = row.pid, "re-adopting live process");
                self.tails
                    .lock()
                    .expect("tail map poisoned")
                    .insert(row.pid, VecDeque::with_capacity(TAIL_CAPACITY));
                let specs = crate::hooks::parse_callbacks(&row.callbacks);
                let handle = tokio::spawn(monitor::run_adopted_monitor(monitor::MonitorArgs {
                    pid: row.pid,
                    child: None,
                    stdout: None,
                    stderr: None,
                    stdout_log: PathBuf::from(&row.stdout_log),
                    stderr_log: PathBuf::from(&row.stderr_log),
                    engine: HookEngine::new(specs, std::time::Instant::now()),
                    effects: self.effects.clone(),
                    store: Arc::clone(&self.store),
                    tails: Arc::clone(&self.tails),
                    kill_requested: Arc::clone(&self.kill_requested),
                    row,
                }));
                self.monitors.lock().expect("monitor list poisoned").push(handle);
                recovered += 1;
            } else {
                warn!(pid = row.pid, "process died while the host was down");
                self.store.update_process_exit(row.pid, "lost", None)?;
                let mut engine = HookEngine::new(
                    crate::hooks::parse_callbacks(&row.callbacks),
                    std::time::Instant::now(),
                );
                for hook in engine.on_exit(None) {
                    monitor::dispatch_fired(&self.effects, &row, hook, String::new());
                }
            }
        }
        Ok(recovered)
    }

    /// Stop all monitors.  Children are left running — they stay visible in
    /// the process list and can be killed explicitly.
    pub fn shutdown(&self) {
        for handle in self.monitors.lock().expect("monitor list poisoned").drain(..) {
            handle.abort();
        }
    }
}

fn store_to_tool_error(e: StoreError) -> ToolError {
    ToolError::new(ErrorKind::CommandTimeout, e.to_string())
}
