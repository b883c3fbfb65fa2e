//! Process callbacks: triggers, actions, and the evaluation engine.
//!
//! A tracked process carries a list of `(trigger, action)` pairs.  The output
//! monitor feeds lines, timer ticks, and the final exit into a [`HookEngine`],
//! which decides what fires; the resulting [`HookEffect`]s are posted as
//! one-way messages to the orchestrator, which alone may create branches.
//! That keeps the potentially cyclic process→agent re-entry graph acyclic at
//! the ownership level.

use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Which exits an `on_exit` callback cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitFilter {
    #[default]
    Any,
    Success,
    Failure,
}

impl ExitFilter {
    fn matches(&self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Any => true,
            Self::Success => exit_code == Some(0),
            Self::Failure => exit_code != Some(0),
        }
    }
}

/// What wakes a callback up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    /// The process exited (filtered by exit code).
    OnExit {
        #[serde(default)]
        filter: ExitFilter,
    },
    /// A line of output matched `pattern`.  Firing is delayed by
    /// `delay_secs` while further output accumulates into the payload.
    OnOutputMatch {
        pattern: String,
        #[serde(default = "default_delay_secs")]
        delay_secs: f64,
    },
    /// Wall-clock runtime exceeded `seconds`.
    OnTimeout { seconds: u64 },
}

fn default_delay_secs() -> f64 {
    2.0
}

/// What happens when a callback fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    StopProcess,
    StopBranch,
    InjectContext { text: String },
    SpawnBranch { instruction: String },
}

/// One callback as supplied at spawn time (and persisted with the process).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    #[serde(flatten)]
    pub trigger: Trigger,
    #[serde(flatten)]
    pub action: HookAction,
    /// Firings before the callback disarms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fires: Option<u32>,
    #[serde(default)]
    pub fire_count: u32,
}

impl CallbackSpec {
    pub fn new(trigger: Trigger, action: HookAction) -> Self {
        Self {
            trigger,
            action,
            max_fires: None,
            fire_count: 0,
        }
    }

    fn max_fires(&self) -> u32 {
        self.max_fires.unwrap_or(1)
    }
}

/// Parse a callback list out of tool arguments; invalid entries are dropped
/// with a warning rather than failing the spawn.
pub fn parse_callbacks(value: &Value) -> Vec<CallbackSpec> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| match serde_json::from_value::<CallbackSpec>(v.clone()) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(callback = %v, error = %e, "dropping malformed callback");
                None
            }
        })
        .collect()
}

// ─── Effects ────────────────────────────────────────────────────────────────

/// Request to start a new branch on behalf of a process hook.
#[derive(Debug, Clone)]
pub struct SpawnBranchRequest {
    pub agent: String,
    pub instruction: String,
    /// Context attached to the process at spawn time.
    pub process_context: Value,
    /// The last output lines of the process (bounded by the tail ring).
    pub output_tail: String,
    pub recursion_depth: u32,
    pub parent_branch: Option<i64>,
}

/// One-way message from the hook layer into the orchestrator.
#[derive(Debug, Clone)]
pub enum HookEffect {
    StopProcess {
        pid: u32,
    },
    StopBranch {
        agent: String,
        branch: i64,
    },
    InjectContext {
        agent: String,
        branch: i64,
        text: String,
    },
    SpawnBranch(SpawnBranchRequest),
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// A fired callback, with any accumulated output attached.
#[derive(Debug, Clone)]
pub struct FiredHook {
    pub action: HookAction,
    /// Output gathered during an `on_output_match` delay window, empty for
    /// other triggers.
    pub matched_output: String,
}

struct CallbackState {
    spec: CallbackSpec,
    regex: Option<Regex>,
    /// Delay window for `on_output_match`: deadline plus accumulated lines.
    pending: Option<(Instant, String)>,
    armed: bool,
}

/// Evaluates one process's callbacks as events arrive.
///
/// Owned by the process's output monitor; not shared.
pub struct HookEngine {
    callbacks: Vec<CallbackState>,
    started: Instant,
}

impl HookEngine {
    pub fn new(specs: Vec<CallbackSpec>, started: Instant) -> Self {
        let callbacks = specs
            .into_iter()
            .map(|spec| {
                let regex = match &spec.trigger {
                    Trigger::OnOutputMatch { pattern, .. } => match Regex::new(pattern) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(pattern, error = %e, "disabling callback with invalid regex");
                            None
                        }
                    },
                    _ => None,
                };
                let armed = !matches!(&spec.trigger, Trigger::OnOutputMatch { .. }) || regex.is_some();
                CallbackState {
                    spec,
                    regex,
                    pending: None,
                    armed,
                }
            })
            .collect();
        Self {
            callbacks,
            started,
        }
    }

    /// Feed one output line.  Starts or extends delay windows; never fires
    /// directly (firing happens on [`on_tick`](Self::on_tick)).
    pub fn on_line(&mut self, line: &str, now: Instant) {
        for cb in &mut self.callbacks {
            if !cb.armed {
                continue;
            }
            let Trigger::OnOutputMatch { delay_secs, .. } = cb.spec.trigger else {
                continue;
            };
            if let Some((_, buffer)) = &mut cb.pending {
                buffer.push_str(line);
                buffer.push('\n');
            } else if cb.regex.as_ref().is_some_and(|re| re.is_match(line)) {
                let deadline = now + Duration::from_secs_f64(delay_secs.max(0.0));
                cb.pending = Some((deadline, format!("{line}\n")));
            }
        }
    }

    /// The next instant at which [`on_tick`](Self::on_tick) could fire
    /// something, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.callbacks
            .iter()
            .filter(|cb| cb.armed)
            .filter_map(|cb| match (&cb.spec.trigger, &cb.pending) {
                (_, Some((deadline, _))) => Some(*deadline),
                (Trigger::OnTimeout { seconds }, None) => {
                    Some(self.started + Duration::from_secs(*seconds))
                }
                _ => None,
            })
            .min()
    }

    /// Fire everything due at `now`: elapsed delay windows and timeouts.
    pub fn on_tick(&mut self, now: Instant) -> Vec<FiredHook> {
        let started = self.started;
        let mut fired = Vec::new();
        for cb in &mut self.callbacks {
            if !cb.armed {
                continue;
            }
            let trigger = cb.spec.trigger.clone();
            match (trigger, cb.pending.take()) {
                (Trigger::OnOutputMatch { .. }, Some((deadline, buffer))) => {
                    if deadline <= now {
                        fired.push(FiredHook {
                            action: cb.spec.action.clone(),
                            matched_output: buffer,
                        });
                        register_fire(cb);
                    } else {
                        cb.pending = Some((deadline, buffer));
                    }
                }
                (Trigger::OnTimeout { seconds }, _) => {
                    if now >= started + Duration::from_secs(seconds) {
                        fired.push(FiredHook {
                            action: cb.spec.action.clone(),
                            matched_output: String::new(),
                        });
                        register_fire(cb);
                    }
                }
                _ => {}
            }
        }
        fired
    }

    /// The process exited: flush pending delay windows immediately, then
    /// evaluate `on_exit` callbacks against the exit code.
    pub fn on_exit(&mut self, exit_code: Option<i32>) -> Vec<FiredHook> {
        let mut fired = Vec::new();
        for cb in &mut self.callbacks {
            if !cb.armed {
                continue;
            }
            if let Some((_, buffer)) = cb.pending.take() {
                fired.push(FiredHook {
                    action: cb.spec.action.clone(),
                    matched_output: buffer,
                });
                register_fire(cb);
                continue;
            }
            let trigger = cb.spec.trigger.clone();
            if let Trigger::OnExit { filter } = trigger
                && filter.matches(exit_code)
            {
                fired.push(FiredHook {
                    action: cb.spec.action.clone(),
                    matched_output: String::new(),
                });
                register_fire(cb);
            }
        }
        fired
    }

    /// Current callback states (for persistence).
    pub fn specs(&self) -> Vec<CallbackSpec> {
        self.callbacks.iter().map(|cb| cb.spec.clone()).collect()
    }
}

fn register_fire(cb: &mut CallbackState) {
    cb.spec.fire_count += 1;
    if cb.spec.fire_count >= cb.spec.max_fires() {
        cb.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(specs: Vec<CallbackSpec>) -> HookEngine {
        HookEngine::new(specs, Instant::now())
    }

    // ── Wire form ───────────────────────────────────────────────────────

    #[test]
    fn callback_json_round_trip() {
        let parsed = parse_callbacks(&json!([
            {"trigger": "on_exit", "filter": "failure",
             "action": "spawn_branch", "instruction": "fix it"},
            {"trigger": "on_output_match", "pattern": "ERROR.*",
             "action": "inject_context", "text": "saw an error"},
            {"trigger": "on_timeout", "seconds": 600, "action": "stop_process"},
        ]));
        assert_eq!(parsed.len(), 3);
        assert_eq!(
            parsed[0].trigger,
            Trigger::OnExit { filter: ExitFilter::Failure }
        );
        assert!(matches!(&parsed[1].trigger,
            Trigger::OnOutputMatch { delay_secs, .. } if *delay_secs == 2.0));
        assert_eq!(parsed[2].action, HookAction::StopProcess);
    }

    #[test]
    fn malformed_callbacks_are_dropped() {
        let parsed = parse_callbacks(&json!([
            {"trigger": "on_exit", "action": "stop_process"},
            {"trigger": "wat"},
            42,
        ]));
        assert_eq!(parsed.len(), 1);
    }

    // ── on_exit filters ─────────────────────────────────────────────────

    #[test]
    fn exit_filters() {
        assert!(ExitFilter::Any.matches(Some(0)));
        assert!(ExitFilter::Any.matches(Some(1)));
        assert!(ExitFilter::Any.matches(None));
        assert!(ExitFilter::Success.matches(Some(0)));
        assert!(!ExitFilter::Success.matches(Some(1)));
        assert!(!ExitFilter::Failure.matches(Some(0)));
        assert!(ExitFilter::Failure.matches(Some(2)));
        assert!(ExitFilter::Failure.matches(None));
    }

    #[test]
    fn exit_hook_fires_on_matching_code() {
        let mut e = engine(vec![CallbackSpec::new(
            Trigger::OnExit { filter: ExitFilter::Failure },
            HookAction::SpawnBranch { instruction: "investigate".into() },
        )]);
        let fired = e.on_exit(Some(1));
        assert_eq!(fired.len(), 1);
        assert!(matches!(&fired[0].action, HookAction::SpawnBranch { .. }));
        // Disarmed after max_fires (default 1).
        assert!(e.on_exit(Some(1)).is_empty());
    }

    #[test]
    fn exit_hook_skips_non_matching_code() {
        let mut e = engine(vec![CallbackSpec::new(
            Trigger::OnExit { filter: ExitFilter::Failure },
            HookAction::StopBranch,
        )]);
        assert!(e.on_exit(Some(0)).is_empty());
    }

    // ── on_output_match delay windows ───────────────────────────────────

    #[test]
    fn output_match_accumulates_then_fires() {
        let t0 = Instant::now();
        let mut e = HookEngine::new(
            vec![CallbackSpec::new(
                Trigger::OnOutputMatch { pattern: "ready".into(), delay_secs: 2.0 },
                HookAction::InjectContext { text: "server is up".into() },
            )],
            t0,
        );

        e.on_line("booting", t0);
        assert!(e.next_deadline().is_none());

        e.on_line("server ready on :8080", t0);
        e.on_line("accepting connections", t0 + Duration::from_millis(500));

        // Not yet due.
        assert!(e.on_tick(t0 + Duration::from_secs(1)).is_empty());

        let fired = e.on_tick(t0 + Duration::from_secs(3));
        assert_eq!(fired.len(), 1);
        assert!(fired[0].matched_output.contains("server ready on :8080"));
        assert!(fired[0].matched_output.contains("accepting connections"));

        // One-shot by default.
        e.on_line("server ready again", t0 + Duration::from_secs(4));
        assert!(e.on_tick(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn output_match_respects_max_fires() {
        let t0 = Instant::now();
        let mut spec = CallbackSpec::new(
            Trigger::OnOutputMatch { pattern: "hit".into(), delay_secs: 0.0 },
            HookAction::StopProcess,
        );
        spec.max_fires = Some(2);
        let mut e = HookEngine::new(vec![spec], t0);

        for round in 0..3 {
            e.on_line("hit", t0);
            let fired = e.on_tick(t0 + Duration::from_secs(1));
            if round < 2 {
                assert_eq!(fired.len(), 1, "round {round}");
            } else {
                assert!(fired.is_empty(), "disarmed after two fires");
            }
        }
    }

    #[test]
    fn invalid_regex_disables_callback() {
        let t0 = Instant::now();
        let mut e = HookEngine::new(
            vec![CallbackSpec::new(
                Trigger::OnOutputMatch { pattern: "([bad".into(), delay_secs: 0.0 },
                HookAction::StopProcess,
            )],
            t0,
        );
        e.on_line("([bad", t0);
        assert!(e.on_tick(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn pending_window_flushes_on_exit() {
        let t0 = Instant::now();
        let mut e = HookEngine::new(
            vec![CallbackSpec::new(
                Trigger::OnOutputMatch { pattern: "panic".into(), delay_secs: 5.0 },
                HookAction::SpawnBranch { instruction: "triage".into() },
            )],
            t0,
        );
        e.on_line("thread 'main' panicked", t0);
        let fired = e.on_exit(Some(101));
        assert_eq!(fired.len(), 1);
        assert!(fired[0].matched_output.contains("panicked"));
    }

    // ── on_timeout ──────────────────────────────────────────────────────

    #[test]
    fn timeout_fires_once_past_deadline() {
        let t0 = Instant::now();
        let mut e = HookEngine::new(
            vec![CallbackSpec::new(
                Trigger::OnTimeout { seconds: 60 },
                HookAction::StopProcess,
            )],
            t0,
        );
        assert_eq!(e.next_deadline(), Some(t0 + Duration::from_secs(60)));
        assert!(e.on_tick(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(e.on_tick(t0 + Duration::from_secs(61)).len(), 1);
        // Once only.
        assert!(e.on_tick(t0 + Duration::from_secs(120)).is_empty());
        assert!(e.next_deadline().is_none());
    }

    #[test]
    fn fire_count_persisted_in_specs() {
        let mut e = engine(vec![CallbackSpec::new(
            Trigger::OnExit { filter: ExitFilter::Any },
            HookAction::StopBranch,
        )]);
        e.on_exit(Some(0));
        assert_eq!(e.specs()[0].fire_count, 1);
    }
}
