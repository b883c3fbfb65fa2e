//! Rate-limited outbound sender.
//!
//! One task per runtime drains a queue of outbound messages, enforcing the
//! per-channel service limit with a sliding window and rotating fairly
//! across branches inside each channel.  Callers get the service-assigned
//! message id back so replies can be routed.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::OutboundConfig;
use crate::gateway::Gateway;

struct Pending {
    branch: i64,
    text: String,
    reply: oneshot::Sender<Result<String, String>>,
}

/// Sliding send-window for one channel.
struct ChannelState {
    /// Per-branch FIFO queues, drained round-robin.
    queues: Vec<(i64, VecDeque<Pending>)>,
    /// Branch served last, so rotation resumes after it even when branches
    /// come and go between sends.
    last_served: Option<i64>,
    sent_at: VecDeque<Instant>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            queues: Vec::new(),
            last_served: None,
            sent_at: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, pending: Pending) {
        let branch = pending.branch;
        match self.queues.iter_mut().find(|(b, _)| *b == branch) {
            Some((_, q)) => q.push_back(pending),
            None => {
                let mut q = VecDeque::new();
                q.push_back(pending);
                self.queues.push((branch, q));
            }
        }
    }

    /// Next message in round-robin order, if any.
    fn dequeue(&mut self) -> Option<Pending> {
        if self.queues.is_empty() {
            return None;
        }
        let n = self.queues.len();
        let start = self
            .last_served
            .and_then(|b| self.queues.iter().position(|(id, _)| *id == b))
            .map(|i| i + 1)
            .unwrap_or(0);
        for k in 0..n {
            let idx = (start + k) % n;
            if let Some(msg) = self.queues[idx].1.pop_front() {
                self.last_served = Some(self.queues[idx].0);
                return Some(msg);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(|(_, q)| q.is_empty())
    }

    /// Whether a send fits the window right now; if not, when it will.
    fn capacity(&mut self, limit: usize, window: Duration, now: Instant) -> Result<(), Instant> {
        while let Some(front) = self.sent_at.front() {
            if now.duration_since(*front) >= window {
                self.sent_at.pop_front();
            } else {
                break;
            }
        }
        if self.sent_at.len() < limit {
            Ok(())
        } else {
            // Capacity frees when the oldest send ages out.
            Err(*self.sent_at.front().expect("non-empty window") + window)
        }
    }
}

enum Command {
    Send {
        channel: String,
        branch: i64,
        text: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
    /// Acknowledged once every channel queue is empty.
    Drain { done: oneshot::Sender<()> },
}

/// Handle for enqueueing outbound messages.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Command>,
}

impl OutboundSender {
    /// Queue a message and wait for its service-assigned id.
    pub async fn send(&self, channel: &str, branch: i64, text: &str) -> Result<String, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                channel: channel.to_owned(),
                branch,
                text: text.to_owned(),
                reply,
            })
            .await
            .map_err(|_| "outbound queue stopped".to_string())?;
        rx.await.map_err(|_| "outbound queue dropped message".to_string())?
    }

    /// Flush everything still queued, honoring the rate limit, and return
    /// once every channel is empty.  Used on shutdown so replies waiting
    /// behind the limiter are not lost.
    pub async fn drain(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Command::Drain { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the outbound queue task.
pub fn start_outbound(gateway: Arc<dyn Gateway>, config: OutboundConfig) -> OutboundSender {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_queue(gateway, config, rx));
    OutboundSender { tx }
}

async fn run_queue(
    gateway: Arc<dyn Gateway>,
    config: OutboundConfig,
    mut rx: mpsc::Receiver<Command>,
) {
    let window = Duration::from_secs(config.rate_limit_secs);
    let mut channels: HashMap<String, ChannelState> = HashMap::new();
    let mut drain_waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        // Ship everything the rate limit allows; find the next wake-up.
        let mut next_wake: Option<Instant> = None;
        for (channel, state) in channels.iter_mut() {
            loop {
                if state.is_empty() {
                    break;
                }
                match state.capacity(config.rate_limit_count, window, Instant::now()) {
                    Ok(()) => {
                        let Some(pending) = state.dequeue() else { break };
                        state.sent_at.push_back(Instant::now());
                        let result = gateway.send(channel, &pending.text).await;
                        if let Err(e) = &result {
                            warn!(channel, error = %e, "outbound send failed");
                        }
                        let _ = pending.reply.send(result);
                    }
                    Err(at) => {
                        next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
                        break;
                    }
                }
            }
        }

        if !drain_waiters.is_empty() && channels.values().all(ChannelState::is_empty) {
            for done in drain_waiters.drain(..) {
                let _ = done.send(());
            }
        }

        let command = match next_wake {
            Some(at) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(at), rx.recv()).await
                {
                    Ok(cmd) => cmd,
                    Err(_) => continue, // window opened; retry sends
                }
            }
            None => rx.recv().await,
        };

        match command {
            Some(Command::Send { channel, branch, text, reply }) => {
                channels
                    .entry(channel)
                    .or_insert_with(ChannelState::new)
                    .enqueue(Pending { branch, text, reply });
            }
            Some(Command::Drain { done }) => drain_waiters.push(done),
            None => return,
        }
    }
}
