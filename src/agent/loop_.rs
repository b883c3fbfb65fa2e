//! The agentic tool loop.
//!
//! # Algorithm
//!
//! ```text
//! window + sibling/process preamble
//!       │
//!       ▼
//! provider.chat(system + tools + history, cache hints)
//!       │
//!       ▼ no tool calls? ──► drain injections ──► empty? ──► return text
//!       ▼ tool calls present
//! for each call:
//!   action = tool:<name>:<detail>;  decide(action)
//!     Deny  → synthesized denial result
//!     Ask   → approval prompt (timeout ⇒ deny); batch turns sequential
//!     Allow → execute (parallel across the batch, joined in call order)
//!       │
//!       ▼
//! append tool_use + tool_results (same order as the calls), drain injections
//!       │
//!       ▼
//! iteration += 1; at max_iterations → return last text, marked truncated
//! ```
//!
//! Tool failures become `{"error": "<kind>", "message": ...}` results and
//! the loop continues; provider failures end the branch as ERRORED.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::ai::provider::ChatProvider;
use crate::ai::types::{ChatMessage, ChatRequest, ChatResponse, ToolCall, Usage};
use crate::branch::{BranchStatus, ExecutionBranch};
use crate::context::{ContextStore, build_preamble};
use crate::error::{ErrorKind, ToolError};
use crate::gateway::{AskOutcome, AskRequest};
use crate::security::{Decision, PermissionProfile, format_action};
use crate::store::StoredMessage;
use crate::tools::{ToolContext, ToolRegistry};

use super::events::{EventSink, LoopEvent};

/// Resolves approval prompts.  Implementations bind the prompt to the
/// invoking user and apply the ask timeout; the loop only consumes the
/// outcome.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn ask(&self, request: AskRequest) -> AskOutcome;
}

/// Result of a finished loop run.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Final assistant text (possibly the last partial text when truncated).
    pub text: String,
    /// True when the run stopped at the iteration cap.
    pub truncated: bool,
    pub usage: Usage,
    pub iterations: usize,
}

/// Branch-terminal failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LoopError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything a loop run needs.  Built once per branch run by the
/// orchestrator.
pub struct ToolLoopParams {
    pub provider: Arc<dyn ChatProvider>,
    pub registry: Arc<ToolRegistry>,
    pub profile: PermissionProfile,
    pub approver: Arc<dyn Approver>,
    pub events: Arc<dyn EventSink>,
    pub ctx: ToolContext,
    pub branch: Arc<ExecutionBranch>,
    pub context_store: Arc<ContextStore>,
    pub system_prompt: String,
    pub model: String,
    pub max_iterations: usize,
    pub channel_id: String,
}

pub struct ToolLoop {
    p: ToolLoopParams,
}

impl ToolLoop {
    pub fn new(params: ToolLoopParams) -> Self {
        Self { p: params }
    }

    /// Drive the branch until the model finishes, the iteration cap hits, or
    /// the provider fails.
    #[tracing::instrument(
        name = "loop.run",
        skip_all,
        fields(agent = %self.p.ctx.agent, branch = self.p.branch.id)
    )]
    pub async fn run(&self) -> Result<LoopOutcome, LoopError> {
        let p = &self.p;
        let agent_record = p.ctx.agent_state.read().expect("agent state poisoned").clone();

        let mut history: Vec<ChatMessage> = p
            .context_store
            .get_window(&agent_record, p.branch.id)
            .map_err(|e| self.fail(ErrorKind::ProviderError, e.to_string()))?;
        let mut usage = Usage::default();
        let mut last_text = String::new();

        for iteration in 0..p.max_iterations {
            p.branch.begin_step("Calling LLM");
            p.events.emit(LoopEvent::LlmCallStart {
                agent: p.ctx.agent.clone(),
                branch: p.branch.id,
                iteration,
            });

            let response = match p.provider.chat(self.build_request(&history)).await {
                Ok(r) => r,
                Err(e) => return Err(self.fail(e.kind(), e.to_string())),
            };
            usage.absorb(&response.usage);
            p.events.emit(LoopEvent::LlmCallComplete {
                agent: p.ctx.agent.clone(),
                branch: p.branch.id,
                usage: response.usage,
            });

            if let Some(text) = &response.text {
                last_text = text.clone();
            }

            if response.tool_calls.is_empty() {
                self.push(&mut history, self.assistant_message(&response));
                if self.drain_injections(&mut history) == 0 {
                    p.branch.end_step();
                    p.events.emit(LoopEvent::LoopComplete {
                        agent: p.ctx.agent.clone(),
                        branch: p.branch.id,
                        truncated: false,
                    });
                    return Ok(LoopOutcome {
                        text: last_text,
                        truncated: false,
                        usage,
                        iterations: iteration + 1,
                    });
                }
                // New user input arrived mid-run; keep going.
                continue;
            }

            self.push(&mut history, self.assistant_message(&response));
            let results = self.run_batch(&response.tool_calls).await;
            for (call_id, payload) in results {
                self.push(&mut history, ChatMessage::tool_result(call_id, payload));
            }
            self.drain_injections(&mut history);
        }

        warn!(branch = self.p.branch.id, "iteration cap reached");
        p.branch.end_step();
        p.events.emit(LoopEvent::LoopComplete {
            agent: p.ctx.agent.clone(),
            branch: p.branch.id,
            truncated: true,
        });
        Ok(LoopOutcome {
            text: last_text,
            truncated: true,
            usage,
            iterations: p.max_iterations,
        })
    }

    // ── Request assembly ────────────────────────────────────────────────

    fn build_request(&self, history: &[ChatMessage]) -> ChatRequest {
        let p = &self.p;
        let preamble = build_preamble(
            p.branch.id,
            &p.ctx.manager.list_active(),
            &p.ctx.processes.running(),
            |pid| p.ctx.processes.tail(pid).last().cloned(),
        );

        let mut messages = Vec::with_capacity(history.len() + 1);
        if !preamble.is_empty() {
            messages.push(ChatMessage::user(format!("[runtime status]\n{preamble}")));
        }
        messages.extend_from_slice(history);

        // The static prefix (system prompt + docs + tool schemas) is marked
        // cacheable; the preamble and history are the dynamic tail.
        ChatRequest::new(&p.model, messages)
            .with_system(&p.system_prompt)
            .with_tools(p.registry.project_for(&p.profile))
            .with_cache(true)
    }

    fn assistant_message(&self, response: &ChatResponse) -> ChatMessage {
        let text = response.text.clone().unwrap_or_default();
        if response.tool_calls.is_empty() {
            ChatMessage::assistant(text)
        } else {
            let mut m = ChatMessage::tool_use(text, response.tool_calls.clone());
            m.raw_blocks = response.raw_blocks.clone();
            m
        }
    }

    /// Append to the in-memory history and persist the row.
    fn push(&self, history: &mut Vec<ChatMessage>, message: ChatMessage) {
        let p = &self.p;
        let row = StoredMessage {
            id: 0,
            agent: p.ctx.agent.clone(),
            branch: p.branch.id,
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            timestamp: Utc::now(),
            outbound_message_id: None,
        };
        if let Err(e) = p.context_store.persist(&row) {
            warn!(branch = p.branch.id, error = %e, "failed to persist message");
        }
        history.push(message);
    }

    /// Move queued user messages into the conversation; they become visible
    /// on the next provider call.
    fn drain_injections(&self, history: &mut Vec<ChatMessage>) -> usize {
        let injected = self.p.branch.inject_queue.drain();
        let n = injected.len();
        for text in injected {
            debug!(branch = self.p.branch.id, "merging injected message");
            self.push(history, ChatMessage::user(text));
        }
        n
    }

    // ── Tool execution ──────────────────────────────────────────────────

    /// Execute one response's calls.  If any call needs approval the whole
    /// batch runs sequentially (the ask UI is serialized); otherwise calls
    /// run as parallel subtasks joined in response order.
    async fn run_batch(&self, calls: &[ToolCall]) -> Vec<(String, String)> {
        let p = &self.p;
        let any_ask = calls.iter().any(|call| {
            p.registry.get(&call.name).is_some_and(|tool| {
                let action = format_action(&call.name, &tool.build_detail(&call.arguments));
                p.profile.decide(&action) == Decision::Ask
            })
        });

        if any_ask {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push((call.id.clone(), self.run_call(call).await));
            }
            results
        } else {
            let payloads = join_all(calls.iter().map(|call| self.run_call(call))).await;
            calls
                .iter()
                .map(|c| c.id.clone())
                .zip(payloads)
                .collect()
        }
    }

    /// One tool call from decision to payload.  Never errors: failures are
    /// rendered so the model can adapt.
    async fn run_call(&self, call: &ToolCall) -> String {
        let p = &self.p;
        let Some(tool) = p.registry.get(&call.name) else {
            return ToolError::new(
                ErrorKind::UnknownTool,
                format!("no tool named '{}'", call.name),
            )
            .to_payload()
            .to_string();
        };

        let detail = tool.build_detail(&call.arguments);
        let action = format_action(&call.name, &detail);
        let decision = p.profile.decide(&action);
        self.audit(&action, decision.as_str());

        match decision {
            Decision::Deny => {
                return ToolError::new(
                    ErrorKind::PermissionDenied,
                    format!("'{action}' is denied by the current profile"),
                )
                .to_payload()
                .to_string();
            }
            Decision::Ask => {
                p.branch.set_status(BranchStatus::WaitingForPermission);
                p.branch.begin_step(format!("Awaiting permission: {action}"));
                p.events.emit(LoopEvent::PermissionAsked {
                    agent: p.ctx.agent.clone(),
                    branch: p.branch.id,
                    action: action.clone(),
                });

                let outcome = p
                    .approver
                    .ask(AskRequest {
                        channel_id: p.channel_id.clone(),
                        agent: p.ctx.agent.clone(),
                        branch_id: p.branch.id,
                        action: action.clone(),
                        user_id: p.ctx.invoking_user.id.clone(),
                    })
                    .await;
                p.branch.set_status(BranchStatus::Running);

                match outcome {
                    AskOutcome::Approved => self.audit(&action, "approved"),
                    AskOutcome::Denied => {
                        self.audit(&action, "denied");
                        return ToolError::new(
                            ErrorKind::PermissionDenied,
                            format!("'{action}' was denied by the user"),
                        )
                        .to_payload()
                        .to_string();
                    }
                    AskOutcome::TimedOut => {
                        self.audit(&action, "ask_timeout");
                        return ToolError::new(
                            ErrorKind::AskTimeout,
                            format!("approval for '{action}' timed out"),
                        )
                        .to_payload()
                        .to_string();
                    }
                }
            }
            Decision::Allow => {}
        }

        p.branch
            .begin_step(format!("Executing {}: {}", call.name, clip(&detail, 60)));
        p.events.emit(LoopEvent::ToolCallStart {
            agent: p.ctx.agent.clone(),
            branch: p.branch.id,
            tool: call.name.clone(),
            detail: detail.clone(),
        });

        let (payload, success) = match tool.execute(&p.ctx, call.arguments.clone()).await {
            Ok(result) => (result.output, result.success),
            Err(e) => {
                if e.kind == ErrorKind::BlocklistedCommand {
                    // Blocklist hits short-circuit before any subprocess;
                    // they are recorded as denials.
                    self.audit(&action, "deny");
                }
                (e.to_payload().to_string(), false)
            }
        };

        p.events.emit(LoopEvent::ToolCallComplete {
            agent: p.ctx.agent.clone(),
            branch: p.branch.id,
            tool: call.name.clone(),
            success,
        });
        payload
    }

    // ── Failure / audit ─────────────────────────────────────────────────

    fn fail(&self, kind: ErrorKind, message: String) -> LoopError {
        let p = &self.p;
        warn!(branch = p.branch.id, %kind, message, "branch failed");
        p.branch.end_step();
        p.branch.set_status(BranchStatus::Errored);
        p.events.emit(LoopEvent::BranchFailed {
            agent: p.ctx.agent.clone(),
            branch: p.branch.id,
            error: kind.to_string(),
        });
        LoopError { kind, message }
    }

    fn audit(&self, action: &str, decision: &str) {
        let p = &self.p;
        if let Err(e) = p.ctx.store.append_audit(
            &p.ctx.agent,
            action,
            decision,
            &p.ctx.invoking_user.id,
            "",
        ) {
            warn!(error = %e, "failed to append audit row");
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    } else {
        s.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::{Role, StopReason};
    use crate::branch::BranchManager;
    use crate::error::ProviderError;
    use crate::process::ProcessManager;
    use crate::security::ProfileSpec;
    use crate::store::{AgentRecord, Store};
    use crate::tools::traits::{Tool, ToolResult};
    use crate::tools::{InvokingUser, builtin_registry};
    use crate::workspace::FileLocks;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    // ── Mock provider ───────────────────────────────────────────────────

    struct MockProvider {
        responses: Mutex<Vec<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockProvider {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn text(content: &str) -> ChatResponse {
            ChatResponse {
                text: Some(content.to_owned()),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
                model: "mock".into(),
                raw_blocks: None,
            }
        }

        fn tool_use(calls: Vec<ToolCall>) -> ChatResponse {
            ChatResponse {
                text: None,
                tool_calls: calls,
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
                model: "mock".into(),
                raw_blocks: None,
            }
        }

        fn seen_requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatProvider for MockProvider {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(ProviderError::Request("mock exhausted".into()))
            } else {
                Ok(responses.remove(0))
            }
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    // ── Scripted approver ───────────────────────────────────────────────

    struct ScriptedApprover {
        outcomes: Mutex<Vec<AskOutcome>>,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedApprover {
        fn new(outcomes: Vec<AskOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Approver for ScriptedApprover {
        async fn ask(&self, request: AskRequest) -> AskOutcome {
            self.asked.lock().unwrap().push(request.action);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                AskOutcome::TimedOut
            } else {
                outcomes.remove(0)
            }
        }
    }

    // ── Ordering probe tool ─────────────────────────────────────────────

    /// Echoes its "tag" argument after an optional sleep, recording
    /// completion order so parallel joins can be verified.
    struct SleepyEcho {
        completions: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for SleepyEcho {
        fn name(&self) -> &str {
            "sleepy_echo"
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn build_detail(&self, args: &Value) -> String {
            args.get("tag").and_then(Value::as_str).unwrap_or_default().to_owned()
        }
        async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
            let tag = args.get("tag").and_then(Value::as_str).unwrap_or("?").to_owned();
            let ms = args.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            self.completions.lock().unwrap().push(tag.clone());
            Ok(ToolResult::ok(format!("echo:{tag}")))
        }
    }

    // ── Fixture ─────────────────────────────────────────────────────────

    struct Fixture {
        store: Arc<Store>,
        context_store: Arc<ContextStore>,
        ctx: ToolContext,
        branch: Arc<ExecutionBranch>,
        _home: TempDir,
    }

    fn fixture() -> Fixture {
        let home = TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = Arc::new(BranchManager::new("alpha", Arc::clone(&store)));
        let context_store = Arc::new(ContextStore::new(
            Arc::clone(&store),
            home.path().to_path_buf(),
        ));

        let record = AgentRecord {
            name: "alpha".into(),
            channel_id: "chan-alpha".into(),
            model: "mock-model".into(),
            permissions: ProfileSpec::Preset("standard".into()),
            created_at: Utc::now(),
            last_clear: chrono::DateTime::<Utc>::MIN_UTC,
            window_seconds: 86_400,
            status: "active".into(),
        };
        store.upsert_agent(&record).unwrap();

        let (effects_tx, effects_rx) = mpsc::channel(16);
        std::mem::forget(effects_rx);
        let (req_tx, req_rx) = mpsc::channel(16);
        std::mem::forget(req_rx);
        let processes = Arc::new(ProcessManager::new(
            Arc::clone(&store),
            home.path().to_path_buf(),
            effects_tx,
        ));

        let branch = manager.create_branch("seed message", None, 0);
        let ctx = ToolContext {
            agent: "alpha".into(),
            branch_id: branch.id,
            home: home.path().to_path_buf(),
            workspace: home.path().canonicalize().unwrap(),
            manager: Arc::clone(&manager),
            lock_timeout: std::time::Duration::from_secs(5),
            store: Arc::clone(&store),
            processes,
            requests: req_tx,
            agent_state: Arc::new(std::sync::RwLock::new(record)),
            invoking_user: InvokingUser { id: "user-1".into(), roles: vec![] },
            granter_roles: vec![],
            recursion_depth: 0,
            branch: Some(Arc::clone(&branch)),
        };

        Fixture {
            store,
            context_store,
            ctx,
            branch,
            _home: home,
        }
    }

    impl Fixture {
        fn seed(&self, content: &str) {
            self.context_store
                .persist(&StoredMessage {
                    id: 0,
                    agent: "alpha".into(),
                    branch: self.branch.id,
                    role: Role::User,
                    content: content.into(),
                    tool_calls: vec![],
                    tool_call_id: None,
                    timestamp: Utc::now(),
                    outbound_message_id: None,
                })
                .unwrap();
        }

        fn loop_with(
            &self,
            provider: Arc<MockProvider>,
            registry: ToolRegistry,
            profile: &str,
            approver: Arc<dyn Approver>,
        ) -> ToolLoop {
            ToolLoop::new(ToolLoopParams {
                provider,
                registry: Arc::new(registry),
                profile: PermissionProfile::preset(profile).unwrap(),
                approver,
                events: Arc::new(crate::agent::events::NullSink),
                ctx: self.ctx.clone(),
                branch: Arc::clone(&self.branch),
                context_store: Arc::clone(&self.context_store),
                system_prompt: "You are alpha.".into(),
                model: "mock-model".into(),
                max_iterations: 25,
                channel_id: "chan-alpha".into(),
            })
        }
    }

    fn denying_approver() -> Arc<dyn Approver> {
        ScriptedApprover::new(vec![AskOutcome::Denied])
    }

    fn echo_registry(completions: Arc<Mutex<Vec<String>>>) -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(SleepyEcho { completions }));
        r
    }

    fn open_loop_registry() -> (ToolRegistry, Arc<Mutex<Vec<String>>>) {
        let completions = Arc::new(Mutex::new(Vec::new()));
        (echo_registry(Arc::clone(&completions)), completions)
    }

    // ── Tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_turn_returns_text() {
        let f = fixture();
        f.seed("hello");
        let provider = MockProvider::new(vec![MockProvider::text("Hello back.")]);
        let outcome = f
            .loop_with(Arc::clone(&provider), builtin_registry(), "standard", denying_approver())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.text, "Hello back.");
        assert!(!outcome.truncated);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.usage.input_tokens, 10);

        // The assistant turn was persisted into the window.
        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        assert_eq!(window.last().unwrap().role, Role::Assistant);
        assert_eq!(window.last().unwrap().content, "Hello back.");
    }

    #[tokio::test]
    async fn request_carries_system_tools_and_cache_hint() {
        let f = fixture();
        f.seed("hi");
        let provider = MockProvider::new(vec![MockProvider::text("ok")]);
        f.loop_with(Arc::clone(&provider), builtin_registry(), "standard", denying_approver())
            .run()
            .await
            .unwrap();

        let requests = provider.seen_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system, "You are alpha.");
        assert!(requests[0].cache);
        assert!(!requests[0].tools.is_empty());
        assert_eq!(requests[0].messages.last().unwrap().content, "hi");
    }

    #[tokio::test]
    async fn tool_call_executes_then_finishes() {
        let f = fixture();
        f.seed("run the probe");
        let (registry, completions) = open_loop_registry();
        let provider = MockProvider::new(vec![
            MockProvider::tool_use(vec![ToolCall::new("c1", "sleepy_echo", json!({"tag": "a"}))]),
            MockProvider::text("done"),
        ]);

        let outcome = f
            .loop_with(Arc::clone(&provider), registry, "open", denying_approver())
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(completions.lock().unwrap().as_slice(), ["a"]);

        // tool_use ids and tool_result ids line up, in order.
        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let tool_use = window.iter().find(|m| m.role == Role::ToolUse).unwrap();
        let result = window.iter().find(|m| m.role == Role::ToolResult).unwrap();
        assert_eq!(tool_use.tool_calls[0].id, "c1");
        assert_eq!(result.tool_call_id.as_deref(), Some("c1"));
        assert!(result.content.contains("echo:a"));
    }

    #[tokio::test]
    async fn parallel_results_join_in_call_order() {
        let f = fixture();
        f.seed("probe twice");
        let (registry, completions) = open_loop_registry();
        let provider = MockProvider::new(vec![
            MockProvider::tool_use(vec![
                ToolCall::new("c1", "sleepy_echo", json!({"tag": "slow", "sleep_ms": 120})),
                ToolCall::new("c2", "sleepy_echo", json!({"tag": "fast"})),
            ]),
            MockProvider::text("done"),
        ]);

        f.loop_with(Arc::clone(&provider), registry, "open", denying_approver())
            .run()
            .await
            .unwrap();

        // Completion order shows real concurrency (fast finished first)...
        assert_eq!(completions.lock().unwrap().as_slice(), ["fast", "slow"]);

        // ...but the recorded results keep the call order.
        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let results: Vec<&StoredMessage> =
            window.iter().filter(|m| m.role == Role::ToolResult).collect();
        assert_eq!(results[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(results[1].tool_call_id.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn denied_tool_yields_error_payload_and_loop_continues() {
        let f = fixture();
        f.seed("try something forbidden");
        let provider = MockProvider::new(vec![
            MockProvider::tool_use(vec![ToolCall::new(
                "c1",
                "bash",
                json!({"command": "ls"}),
            )]),
            MockProvider::text("understood, moving on"),
        ]);

        // Locked profile: bash is neither allowed nor asked — denied.
        let outcome = f
            .loop_with(Arc::clone(&provider), builtin_registry(), "locked", denying_approver())
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.text, "understood, moving on");

        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let result = window.iter().find(|m| m.role == Role::ToolResult).unwrap();
        assert!(result.content.contains("PermissionDenied"));

        // The denial is audited.
        let audit = f.store.audit_tail(10).unwrap();
        assert!(audit.iter().any(|r| r.decision == "deny"));
    }

    #[tokio::test]
    async fn ask_denied_by_user_continues_with_denial_result() {
        let f = fixture();
        f.seed("view a file and delete a temp file");
        let approver = ScriptedApprover::new(vec![AskOutcome::Denied]);
        let provider = MockProvider::new(vec![
            // One allowed call and one ask call in the same batch.
            MockProvider::tool_use(vec![
                ToolCall::new("c1", "view", json!({"path": "a.py"})),
                ToolCall::new("c2", "bash", json!({"command": "rm tmp.txt"})),
            ]),
            MockProvider::text("the command was denied, continuing"),
        ]);
        std::fs::write(f._home.path().join("a.py"), "print('hi')").unwrap();

        let outcome = f
            .loop_with(
                Arc::clone(&provider),
                builtin_registry(),
                "standard",
                Arc::clone(&approver) as Arc<dyn Approver>,
            )
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.text, "the command was denied, continuing");

        // The ask was for the bash action string.
        assert_eq!(
            approver.asked.lock().unwrap().as_slice(),
            ["tool:bash:rm tmp.txt"]
        );

        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let results: Vec<&StoredMessage> =
            window.iter().filter(|m| m.role == Role::ToolResult).collect();
        assert_eq!(results.len(), 2);
        // view executed, bash was denied.
        assert!(results[0].content.contains("print('hi')"));
        assert!(results[1].content.contains("PermissionDenied"));
    }

    #[tokio::test]
    async fn ask_timeout_becomes_ask_timeout_payload() {
        let f = fixture();
        f.seed("do the risky thing");
        let approver = ScriptedApprover::new(vec![]); // always times out
        let provider = MockProvider::new(vec![
            MockProvider::tool_use(vec![ToolCall::new("c1", "bash", json!({"command": "ls"}))]),
            MockProvider::text("fine"),
        ]);

        f.loop_with(
            Arc::clone(&provider),
            builtin_registry(),
            "standard",
            approver,
        )
        .run()
        .await
        .unwrap();

        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let result = window.iter().find(|m| m.role == Role::ToolResult).unwrap();
        assert!(result.content.contains("AskTimeout"));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let f = fixture();
        f.seed("use a phantom tool");
        let provider = MockProvider::new(vec![
            MockProvider::tool_use(vec![ToolCall::new("c1", "phantom", json!({}))]),
            MockProvider::text("noted"),
        ]);
        f.loop_with(Arc::clone(&provider), builtin_registry(), "open", denying_approver())
            .run()
            .await
            .unwrap();

        let window = f
            .store
            .window_messages("alpha", f.branch.id, chrono::DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let result = window.iter().find(|m| m.role == Role::ToolResult).unwrap();
        assert!(result.content.contains("UnknownTool"));
    }

    #[tokio::test]
    async fn max_iterations_truncates_without_further_calls() {
        let f = fixture();
        f.seed("loop forever");
        let (registry, _) = open_loop_registry();
        // More tool-call responses than the cap allows.
        let responses: Vec<ChatResponse> = (0..10)
            .map(|i| {
                MockProvider::tool_use(vec![ToolCall::new(
                    format!("c{i}"),
                    "sleepy_echo",
                    json!({"tag": "again"}),
                )])
            })
            .collect();
        let provider = MockProvider::new(responses);

        let mut loop_ = f.loop_with(Arc::clone(&provider), registry, "open", denying_approver());
        loop_.p.max_iterations = 3;
        let outcome = loop_.run().await.unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.iterations, 3);
        // Exactly three provider calls were made.
        assert_eq!(provider.seen_requests().len(), 3);
    }

    #[tokio::test]
    async fn provider_error_marks_branch_errored() {
        let f = fixture();
        f.seed("hello");
        let provider = MockProvider::new(vec![]); // errors immediately
        let err = f
            .loop_with(provider, builtin_registry(), "standard", denying_approver())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderError);
        assert_eq!(f.branch.status(), BranchStatus::Errored);
    }

    #[tokio::test]
    async fn injected_messages_surface_on_next_iteration() {
        let f = fixture();
        f.seed("first question");
        f.branch.inject_queue.push("also do this");
        let provider = MockProvider::new(vec![
            MockProvider::text("answered the first"),
            MockProvider::text("answered the injection"),
        ]);

        let outcome = f
            .loop_with(Arc::clone(&provider), builtin_registry(), "standard", denying_approver())
            .run()
            .await
            .unwrap();
        // The injection forced a second iteration.
        assert_eq!(outcome.text, "answered the injection");

        let requests = provider.seen_requests();
        assert_eq!(requests.len(), 2);
        assert!(
            requests[1]
                .messages
                .iter()
                .any(|m| m.content == "also do this")
        );
    }

    #[tokio::test]
    async fn ask_batch_runs_sequentially() {
        let f = fixture();
        f.seed("two risky things");
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        // An approver that records when it is consulted relative to tool
        // completions proves serialization.
        struct OrderedApprover {
            order: Arc<Mutex<Vec<String>>>,
            count: AtomicUsize,
        }
        #[async_trait]
        impl Approver for OrderedApprover {
            async fn ask(&self, _request: AskRequest) -> AskOutcome {
                let n = self.count.fetch_add(1, Ordering::SeqCst);
                self.order.lock().unwrap().push(format!("ask{n}"));
                AskOutcome::Approved
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SleepyEcho { completions: Arc::clone(&order) }));
        // A profile that asks for everything.
        let profile_loop = {
            let mut params_loop = f.loop_with(
                MockProvider::new(vec![
                    MockProvider::tool_use(vec![
                        ToolCall::new("c1", "sleepy_echo", json!({"tag": "one", "sleep_ms": 50})),
                        ToolCall::new("c2", "sleepy_echo", json!({"tag": "two"})),
                    ]),
                    MockProvider::text("done"),
                ]),
                registry,
                "open",
                Arc::new(OrderedApprover { order: Arc::clone(&order), count: AtomicUsize::new(0) }),
            );
            params_loop.p.profile =
                PermissionProfile::new::<&str>(&[], &["tool:sleepy_echo:.*"]).unwrap();
            params_loop
        };

        profile_loop.run().await.unwrap();

        // ask0 → one → ask1 → two: the second prompt waited for the first
        // tool to finish.
        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["ask0", "one", "ask1", "two"]
        );
    }
}
