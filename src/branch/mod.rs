//! Execution branches: independent tool-loop runs within one agent.

pub mod manager;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{StepRow, Store};

pub use manager::BranchManager;

/// Longest branch summary kept from the seeding message.
pub const SUMMARY_LEN: usize = 50;

/// Injected user messages buffered per branch; oldest dropped on overflow so
/// the latest reply always wins.
pub const INJECT_CAPACITY: usize = 32;

/// Lifecycle of a branch.  Transitions are monotonic except for the
/// RUNNING ⇄ WAITING_FOR_PERMISSION pair and a resume from a settled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Running,
    WaitingForPermission,
    Idle,
    Completed,
    Cancelled,
    Errored,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingForPermission => "waiting_for_permission",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        }
    }

    /// A live branch accepts injections; a settled one is resumed instead.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingForPermission)
    }
}

/// First ≤50 characters of the seeding message, on a char boundary.
pub fn summarize_seed(seed: &str) -> String {
    let line = seed.lines().next().unwrap_or_default();
    line.chars().take(SUMMARY_LEN).collect()
}

// ─── Injection queue ────────────────────────────────────────────────────────

/// Bounded queue of user messages that arrived mid-loop.  Non-blocking from
/// the outside; the loop drains it between iterations.
#[derive(Debug, Default)]
pub struct InjectQueue {
    queue: Mutex<VecDeque<String>>,
}

impl InjectQueue {
    pub fn push(&self, message: impl Into<String>) {
        let mut q = self.queue.lock().expect("inject queue poisoned");
        if q.len() >= INJECT_CAPACITY {
            q.pop_front();
        }
        q.push_back(message.into());
    }

    pub fn drain(&self) -> Vec<String> {
        self.queue
            .lock()
            .expect("inject queue poisoned")
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("inject queue poisoned").is_empty()
    }
}

// ─── Metrics ────────────────────────────────────────────────────────────────

/// One step of loop progress (mirrors a `branch_steps` row).
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub number: i64,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Metrics {
    steps: Vec<StepRecord>,
}

// ─── ExecutionBranch ────────────────────────────────────────────────────────

/// One concurrent execution thread of an agent.
pub struct ExecutionBranch {
    pub agent: String,
    pub id: i64,
    pub summary: String,
    pub parent_branch: Option<i64>,
    pub recursion_depth: u32,
    pub created_at: DateTime<Utc>,
    pub inject_queue: InjectQueue,
    status: Mutex<BranchStatus>,
    metrics: Mutex<Metrics>,
    store: Arc<Store>,
}

impl ExecutionBranch {
    pub(crate) fn new(
        agent: String,
        id: i64,
        summary: String,
        parent_branch: Option<i64>,
        recursion_depth: u32,
        store: Arc<Store>,
    ) -> Self {
        Self {
            agent,
            id,
            summary,
            parent_branch,
            recursion_depth,
            created_at: Utc::now(),
            inject_queue: InjectQueue::default(),
            status: Mutex::new(BranchStatus::Running),
            metrics: Mutex::new(Metrics::default()),
            store,
        }
    }

    pub fn status(&self) -> BranchStatus {
        *self.status.lock().expect("branch status poisoned")
    }

    /// Update the in-memory status and persist it.
    pub fn set_status(&self, status: BranchStatus) {
        *self.status.lock().expect("branch status poisoned") = status;
        if let Err(e) = self
            .store
            .update_branch_status(&self.agent, self.id, status.as_str())
        {
            tracing::warn!(branch = self.id, error = %e, "failed to persist branch status");
        }
    }

    /// Close the current step and open a new one; both are persisted.
    pub fn begin_step(&self, description: impl Into<String>) {
        let description = description.into();
        let now = Utc::now();
        let mut metrics = self.metrics.lock().expect("branch metrics poisoned");

        if let Some(last) = metrics.steps.last_mut()
            && last.ended_at.is_none()
        {
            last.ended_at = Some(now);
            let _ = self.store.insert_step(&StepRow {
                agent: self.agent.clone(),
                branch: self.id,
                step_number: last.number,
                description: last.description.clone(),
                started_at: last.started_at,
                ended_at: Some(now),
                duration_ms: Some((now - last.started_at).num_milliseconds()),
            });
        }

        let number = metrics.steps.len() as i64 + 1;
        metrics.steps.push(StepRecord {
            number,
            description,
            started_at: now,
            ended_at: None,
        });
    }

    /// Close the open step without starting another (terminal transitions).
    pub fn end_step(&self) {
        let now = Utc::now();
        let mut metrics = self.metrics.lock().expect("branch metrics poisoned");
        if let Some(last) = metrics.steps.last_mut()
            && last.ended_at.is_none()
        {
            last.ended_at = Some(now);
            let _ = self.store.insert_step(&StepRow {
                agent: self.agent.clone(),
                branch: self.id,
                step_number: last.number,
                description: last.description.clone(),
                started_at: last.started_at,
                ended_at: Some(now),
                duration_ms: Some((now - last.started_at).num_milliseconds()),
            });
        }
    }

    pub fn step_count(&self) -> usize {
        self.metrics.lock().expect("branch metrics poisoned").steps.len()
    }

    /// Description of the step currently in progress.
    pub fn current_step(&self) -> Option<String> {
        self.metrics
            .lock()
            .expect("branch metrics poisoned")
            .steps
            .last()
            .filter(|s| s.ended_at.is_none())
            .map(|s| s.description.clone())
    }

    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}
