//! Per-agent branch bookkeeping: ids, reply routing, loop tasks, file locks.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ToolError;
use crate::store::{BranchRow, Store};
use crate::workspace::{FileLockGuard, FileLocks};

use super::{BranchStatus, ExecutionBranch, summarize_seed};

/// Owns every branch of one agent, the reply-routing index, and the agent's
/// file-lock table.  One instance per agent, held by the orchestrator.
pub struct BranchManager {
    pub agent: String,
    store: Arc<Store>,
    branches: Mutex<HashMap<i64, Arc<ExecutionBranch>>>,
    /// Outbound message id → branch id, for reply routing.
    outbound_index: Mutex<HashMap<String, i64>>,
    /// Write-lock table for this agent's workspace; reached only through
    /// [`acquire_file_lock`](Self::acquire_file_lock).
    file_locks: Arc<FileLocks>,
    next_id: AtomicI64,
    tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl BranchManager {
    pub fn new(agent: impl Into<String>, store: Arc<Store>) -> Self {
        let agent = agent.into();
        // Branch ids continue where the previous run stopped.
        let start = store.max_branch_id(&agent).unwrap_or(0);
        Self {
            agent,
            store,
            branches: Mutex::new(HashMap::new()),
            outbound_index: Mutex::new(HashMap::new()),
            file_locks: Arc::new(FileLocks::new()),
            next_id: AtomicI64::new(start + 1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a branch seeded by `seed`, persisted as RUNNING.  The caller
    /// spawns the loop task and attaches it via [`attach_task`](Self::attach_task).
    pub fn create_branch(
        &self,
        seed: &str,
        parent_branch: Option<i64>,
        recursion_depth: u32,
    ) -> Arc<ExecutionBranch> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let summary = summarize_seed(seed);
        let branch = Arc::new(ExecutionBranch::new(
            self.agent.clone(),
            id,
            summary.clone(),
            parent_branch,
            recursion_depth,
            Arc::clone(&self.store),
        ));

        if let Err(e) = self.store.upsert_branch(&BranchRow {
            agent: self.agent.clone(),
            id,
            status: BranchStatus::Running.as_str().to_owned(),
            summary,
            created_at: Utc::now(),
            parent_branch,
            recursion_depth,
        }) {
            warn!(branch = id, error = %e, "failed to persist new branch");
        }

        self.branches
            .lock()
            .expect("branch map poisoned")
            .insert(id, Arc::clone(&branch));
        info!(agent = %self.agent, branch = id, "branch created");
        branch
    }

    /// Take the write lock for `path`, waiting at most `timeout`.
    ///
    /// Timing out surfaces as a `LockTimeout` tool error — the failure
    /// outcome the tool hands back to the model so it can back off.  The
    /// returned guard releases on drop, so a cancelled loop task cannot
    /// leave a file locked.
    pub async fn acquire_file_lock(
        &self,
        path: &std::path::Path,
        timeout: std::time::Duration,
    ) -> Result<FileLockGuard, ToolError> {
        self.file_locks.acquire(path, timeout).await
    }

    /// Release a held write lock.  Equivalent to dropping the guard; exists
    /// so call sites can release explicitly on their success path while
    /// early returns and cancellation still release through drop.
    pub fn release_file_lock(&self, guard: FileLockGuard) {
        drop(guard);
    }

    /// Distinct workspace paths ever locked (the table only grows).
    pub fn locked_path_count(&self) -> usize {
        self.file_locks.len()
    }

    /// Register the loop task driving `branch`, aborting any stale one.
    pub fn attach_task(&self, branch: i64, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(old) = tasks.insert(branch, task)
            && !old.is_finished()
        {
            warn!(branch, "replacing an unfinished loop task");
            old.abort();
        }
    }

    /// Find the branch that sent the message being replied to.
    pub fn route(&self, in_reply_to: &str) -> Option<Arc<ExecutionBranch>> {
        let id = *self
            .outbound_index
            .lock()
            .expect("outbound index poisoned")
            .get(in_reply_to)?;
        self.get(id)
    }

    /// Record an outbound message so future replies route back here.
    pub fn register_outbound(&self, branch: i64, message_id: impl Into<String>) {
        self.outbound_index
            .lock()
            .expect("outbound index poisoned")
            .insert(message_id.into(), branch);
    }

    pub fn get(&self, id: i64) -> Option<Arc<ExecutionBranch>> {
        self.branches
            .lock()
            .expect("branch map poisoned")
            .get(&id)
            .cloned()
    }

    /// Branches whose loop is currently live.
    pub fn list_active(&self) -> Vec<Arc<ExecutionBranch>> {
        let mut active: Vec<_> = self
            .branches
            .lock()
            .expect("branch map poisoned")
            .values()
            .filter(|b| b.status().is_live())
            .cloned()
            .collect();
        active.sort_by_key(|b| b.id);
        active
    }

    /// Cancel a branch: abort its loop task (releasing any held file locks
    /// as guards drop), record the terminal step, set CANCELLED.
    pub fn kill(&self, id: i64) -> bool {
        let Some(branch) = self.get(id) else {
            return false;
        };
        if let Some(task) = self.tasks.lock().expect("task map poisoned").remove(&id) {
            task.abort();
        }
        branch.begin_step("cancelled");
        branch.end_step();
        branch.set_status(BranchStatus::Cancelled);
        info!(agent = %self.agent, branch = id, "branch cancelled");
        true
    }

    pub fn kill_all(&self) {
        let ids: Vec<i64> = self
            .branches
            .lock()
            .expect("branch map poisoned")
            .keys()
            .copied()
            .collect();
        for id in ids {
            let live = self.get(id).map(|b| b.status().is_live()).unwrap_or(false);
            if live {
                self.kill(id);
            }
        }
    }
}
