//! Lifecycle events emitted by the tool loop.
//!
//! Sinks must never be able to break the loop: emission is fire-and-forget
//! and errors are swallowed by the sink implementations.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ai::types::Usage;

/// One observable moment in a branch's life.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    BranchStarted {
        agent: String,
        branch: i64,
        summary: String,
    },
    LlmCallStart {
        agent: String,
        branch: i64,
        iteration: usize,
    },
    LlmCallComplete {
        agent: String,
        branch: i64,
        usage: Usage,
    },
    ToolCallStart {
        agent: String,
        branch: i64,
        tool: String,
        detail: String,
    },
    ToolCallComplete {
        agent: String,
        branch: i64,
        tool: String,
        success: bool,
    },
    PermissionAsked {
        agent: String,
        branch: i64,
        action: String,
    },
    LoopComplete {
        agent: String,
        branch: i64,
        truncated: bool,
    },
    BranchFailed {
        agent: String,
        branch: i64,
        error: String,
    },
}

impl LoopEvent {
    pub fn branch(&self) -> i64 {
        match self {
            Self::BranchStarted { branch, .. }
            | Self::LlmCallStart { branch, .. }
            | Self::LlmCallComplete { branch, .. }
            | Self::ToolCallStart { branch, .. }
            | Self::ToolCallComplete { branch, .. }
            | Self::PermissionAsked { branch, .. }
            | Self::LoopComplete { branch, .. }
            | Self::BranchFailed { branch, .. } => *branch,
        }
    }

    /// True for events that end a branch's run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoopComplete { .. } | Self::BranchFailed { .. })
    }
}

/// Receives loop events.  Implementations must be non-blocking and
/// infallible from the loop's point of view.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LoopEvent);
}

/// Sink that drops everything (tests, headless runs).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LoopEvent) {}
}

/// Fan-out sink over a tokio broadcast channel.  Lagging or absent
/// subscribers never block emission.
pub struct BroadcastSink {
    tx: broadcast::Sender<LoopEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: LoopEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_sink_fans_out() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        sink.emit(LoopEvent::LlmCallStart {
            agent: "alpha".into(),
            branch: 1,
            iteration: 0,
        });
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.branch(), 1);
        assert!(!ev.is_terminal());
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let sink = BroadcastSink::new(4);
        sink.emit(LoopEvent::LoopComplete {
            agent: "alpha".into(),
            branch: 2,
            truncated: false,
        });
    }

    #[test]
    fn terminal_events() {
        assert!(LoopEvent::LoopComplete { agent: "a".into(), branch: 1, truncated: true }
            .is_terminal());
        assert!(LoopEvent::BranchFailed { agent: "a".into(), branch: 1, error: "x".into() }
            .is_terminal());
        assert!(!LoopEvent::PermissionAsked { agent: "a".into(), branch: 1, action: "t".into() }
            .is_terminal());
    }
}
