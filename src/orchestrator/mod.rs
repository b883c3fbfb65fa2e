//! Inbound routing and wiring.
//!
//! The orchestrator owns one [`BranchManager`] per agent and is the only
//! component that creates branches.  It consumes three queues: inbound chat
//! messages from the gateway, requests from tools (inter-agent comm), and
//! effects from process hooks.  Hook-spawned re-entry therefore stays
//! one-way: the process layer posts a message; branch creation happens here,
//! where depth and concurrency limits are enforced.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::agent::{
    Approver, BroadcastSink, EventSink, LoopEvent, ToolLoop, ToolLoopParams,
};
use crate::ai::provider::ChatProvider;
use crate::ai::types::Role;
use crate::branch::{BranchManager, BranchStatus, ExecutionBranch};
use crate::config::AppConfig;
use crate::context::ContextStore;
use crate::gateway::{AskOutcome, AskRequest, Gateway, InboundMessage};
use crate::hooks::{HookEffect, SpawnBranchRequest};
use crate::process::ProcessManager;
use crate::security::PermissionProfile;
use crate::status::{OutboundSender, PresenceUpdater, StatusView, chunk_with_footer};
use crate::store::{AgentPaths, AgentRecord, Store, StoredMessage};
use crate::tools::{InvokingUser, ToolContext, ToolRegistry};

/// Request from a tool back into the orchestrator.
#[derive(Debug)]
pub enum OrchestratorRequest {
    SendToAgent {
        from: String,
        target: String,
        message: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    ReadAgentDocs {
        target: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
    ListAgents {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Per-agent runtime state.
pub struct AgentRuntime {
    pub record: Arc<RwLock<AgentRecord>>,
    pub manager: Arc<BranchManager>,
    pub events: Arc<BroadcastSink>,
    pub paths: AgentPaths,
    /// Serializes approval prompts in this agent's channel.
    ask_serial: Arc<tokio::sync::Mutex<()>>,
}

/// Approval prompts bound to one channel: serialized, timed out to a denial.
struct ChannelApprover {
    gateway: Arc<dyn Gateway>,
    timeout: Duration,
    serial: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn ask(&self, request: AskRequest) -> AskOutcome {
        let _one_at_a_time = self.serial.lock().await;
        match tokio::time::timeout(self.timeout, self.gateway.ask(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => AskOutcome::TimedOut,
        }
    }
}

pub struct Orchestrator {
    config: AppConfig,
    store: Arc<Store>,
    gateway: Arc<dyn Gateway>,
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ToolRegistry>,
    pub processes: Arc<ProcessManager>,
    context_store: Arc<ContextStore>,
    outbound: OutboundSender,
    presence: Arc<PresenceUpdater>,
    agents: Mutex<HashMap<String, Arc<AgentRuntime>>>,
    requests_tx: mpsc::Sender<OrchestratorRequest>,
    /// Hook-spawned branches currently in flight (global cap).
    hook_spawns: Arc<AtomicUsize>,
    /// Branches with a live loop task, for the presence indicator.
    running: Arc<AtomicUsize>,
}

impl Orchestrator {
    /// Wire up a runtime.  The `requests_tx` half handed in here is the same
    /// sender every tool context gets for calling back in.
    pub fn new(
        config: AppConfig,
        store: Arc<Store>,
        gateway: Arc<dyn Gateway>,
        provider: Arc<dyn ChatProvider>,
        processes: Arc<ProcessManager>,
        outbound: OutboundSender,
        requests_tx: mpsc::Sender<OrchestratorRequest>,
    ) -> Arc<Self> {
        let context_store = Arc::new(ContextStore::new(
            Arc::clone(&store),
            config.runtime.home.clone(),
        ));
        let presence = Arc::new(PresenceUpdater::new(
            Arc::clone(&gateway),
            Duration::from_secs(5),
        ));
        Arc::new(Self {
            config,
            store,
            gateway,
            provider,
            registry: Arc::new(crate::tools::builtin_registry()),
            processes,
            context_store,
            outbound,
            presence,
            agents: Mutex::new(HashMap::new()),
            requests_tx,
            hook_spawns: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Load every persisted agent and build its runtime.
    pub fn load_agents(&self) -> Result<usize, crate::error::StoreError> {
        let records = self.store.list_agents()?;
        let count = records.len();
        for record in records {
            self.adopt_agent(record);
        }
        Ok(count)
    }

    /// Build (or replace) the runtime for one agent and start its status
    /// view task.
    pub fn adopt_agent(&self, record: AgentRecord) -> Arc<AgentRuntime> {
        let name = record.name.clone();
        let paths = AgentPaths::new(&self.config.runtime.home, &name);
        if let Err(e) = paths.ensure() {
            warn!(agent = %name, error = %e, "could not create agent directories");
        }
        let manager = Arc::new(BranchManager::new(name.clone(), Arc::clone(&self.store)));
        let events = Arc::new(BroadcastSink::new(256));

        let view = StatusView::new(
            Arc::clone(&self.gateway),
            Arc::clone(&manager),
            record.channel_id.clone(),
            Duration::from_millis(self.config.outbound.status_edit_interval_ms),
        );
        tokio::spawn(view.run(events.subscribe()));

        let runtime = Arc::new(AgentRuntime {
            record: Arc::new(RwLock::new(record)),
            manager,
            events,
            paths,
            ask_serial: Arc::new(tokio::sync::Mutex::new(())),
        });
        self.agents
            .lock()
            .expect("agent map poisoned")
            .insert(name, Arc::clone(&runtime));
        runtime
    }

    pub fn agent(&self, name: &str) -> Option<Arc<AgentRuntime>> {
        self.agents.lock().expect("agent map poisoned").get(name).cloned()
    }

    fn agent_for_channel(&self, channel_id: &str) -> Option<Arc<AgentRuntime>> {
        self.agents
            .lock()
            .expect("agent map poisoned")
            .values()
            .find(|rt| rt.record.read().expect("record poisoned").channel_id == channel_id)
            .cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .lock()
            .expect("agent map poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Live branches across every agent.
    pub fn active_branches(&self) -> usize {
        self.agents
            .lock()
            .expect("agent map poisoned")
            .values()
            .map(|rt| rt.manager.list_active().len())
            .sum()
    }

    // ── Main loop ───────────────────────────────────────────────────────

    /// Consume the three input queues until all of them close.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut requests: mpsc::Receiver<OrchestratorRequest>,
        mut effects: mpsc::Receiver<HookEffect>,
    ) {
        loop {
            tokio::select! {
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
                Some(request) = requests.recv() => self.handle_request(request).await,
                Some(effect) = effects.recv() => self.handle_effect(effect).await,
                else => break,
            }
        }
        info!("orchestrator input queues closed");
    }

    // ── Inbound messages ────────────────────────────────────────────────

    /// Route one inbound chat message.
    pub async fn handle_inbound(&self, message: InboundMessage) {
        let Some(runtime) = self.agent_for_channel(&message.channel_id) else {
            // Unbound channels belong to the control plane.
            debug!(channel = %message.channel_id, "no agent bound; ignoring");
            return;
        };

        let user = InvokingUser {
            id: message.user_id.clone(),
            roles: message.user_roles.clone(),
        };

        // A reply targets the branch that produced the replied-to message.
        if let Some(reply_to) = &message.reply_to
            && let Some(branch) = runtime.manager.route(reply_to)
        {
            self.persist_user_message(&runtime, branch.id, &message.content);
            if branch.status().is_live() {
                debug!(branch = branch.id, "injecting reply into live branch");
                branch.inject_queue.push(message.content);
            } else {
                debug!(branch = branch.id, "resuming settled branch");
                branch.set_status(BranchStatus::Running);
                self.spawn_loop(&runtime, branch, user);
            }
            return;
        }

        // Everything else (including replies whose target id expired) seeds
        // a fresh branch.
        let branch = runtime.manager.create_branch(&message.content, None, 0);
        self.persist_user_message(&runtime, branch.id, &message.content);
        self.spawn_loop(&runtime, branch, user);
    }

    fn persist_user_message(&self, runtime: &AgentRuntime, branch: i64, content: &str) {
        let agent = runtime.record.read().expect("record poisoned").name.clone();
        if let Err(e) = self.store.insert_message(&StoredMessage {
            id: 0,
            agent,
            branch,
            role: Role::User,
            content: content.to_owned(),
            tool_calls: vec![],
            tool_call_id: None,
            timestamp: Utc::now(),
            outbound_message_id: None,
        }) {
            warn!(error = %e, "failed to persist inbound message");
        }
    }

    // ── Loop task ───────────────────────────────────────────────────────

    /// Start the tool loop for `branch` and handle its terminal state.
    fn spawn_loop(&self, runtime: &Arc<AgentRuntime>, branch: Arc<ExecutionBranch>, user: InvokingUser) {
        let record = runtime.record.read().expect("record poisoned").clone();
        let profile = match record.permissions.compile() {
            Ok(p) => p,
            Err(e) => {
                warn!(agent = %record.name, error = %e, "profile failed to compile; locking down");
                PermissionProfile::preset("locked").expect("locked preset compiles")
            }
        };

        let system_prompt = self.compose_system_prompt(runtime, &record);
        let ctx = ToolContext {
            agent: record.name.clone(),
            branch_id: branch.id,
            home: self.config.runtime.home.clone(),
            workspace: runtime.paths.workspace(),
            manager: Arc::clone(&runtime.manager),
            lock_timeout: Duration::from_secs(self.config.runtime.lock_timeout_secs),
            store: Arc::clone(&self.store),
            processes: Arc::clone(&self.processes),
            requests: self.requests_tx.clone(),
            agent_state: Arc::clone(&runtime.record),
            invoking_user: user,
            granter_roles: self.config.roles.permission_granters.clone(),
            recursion_depth: branch.recursion_depth,
            branch: Some(Arc::clone(&branch)),
        };

        let approver: Arc<dyn Approver> = Arc::new(ChannelApprover {
            gateway: Arc::clone(&self.gateway),
            timeout: Duration::from_secs(self.config.runtime.ask_timeout_secs),
            serial: Arc::clone(&runtime.ask_serial),
        });

        let loop_ = ToolLoop::new(ToolLoopParams {
            provider: Arc::clone(&self.provider),
            registry: Arc::clone(&self.registry),
            profile,
            approver,
            events: runtime.events.clone() as Arc<dyn EventSink>,
            ctx,
            branch: Arc::clone(&branch),
            context_store: Arc::clone(&self.context_store),
            system_prompt,
            model: record.model.clone(),
            max_iterations: self.config.runtime.max_iterations,
            channel_id: record.channel_id.clone(),
        });

        runtime.events.emit(LoopEvent::BranchStarted {
            agent: record.name.clone(),
            branch: branch.id,
            summary: branch.summary.clone(),
        });

        let manager = Arc::clone(&runtime.manager);
        let outbound = self.outbound.clone();
        let presence = Arc::clone(&self.presence);
        let running = Arc::clone(&self.running);
        let channel_id = record.channel_id.clone();
        let agent_name = record.name.clone();
        let message_limit = self.config.outbound.message_limit;
        let branch_id = branch.id;

        let task = tokio::spawn(async move {
            presence.update(running.fetch_add(1, Ordering::SeqCst) + 1).await;
            let started = std::time::Instant::now();
            let result = loop_.run().await;

            match result {
                Ok(outcome) => {
                    branch.set_status(if branch.inject_queue.is_empty() {
                        BranchStatus::Completed
                    } else {
                        // A reply slipped in after the final drain; it will
                        // resume the branch on the next routing pass.
                        BranchStatus::Idle
                    });

                    let footer = format!(
                        "branch #{} · {} steps · {}/{} tokens · {}s{}",
                        branch.id,
                        branch.step_count(),
                        outcome.usage.input_tokens,
                        outcome.usage.output_tokens,
                        started.elapsed().as_secs(),
                        if outcome.truncated { " · truncated" } else { "" },
                    );
                    let text = if outcome.text.is_empty() {
                        "(no reply)".to_owned()
                    } else {
                        outcome.text.clone()
                    };
                    for chunk in chunk_with_footer(&text, &footer, message_limit) {
                        match outbound.send(&channel_id, branch.id, &chunk).await {
                            Ok(message_id) => manager.register_outbound(branch.id, message_id),
                            Err(e) => warn!(agent = %agent_name, error = %e, "failed to send reply"),
                        }
                    }
                }
                Err(e) => {
                    // The loop already set ERRORED and emitted the event;
                    // surface a short human-readable failure.
                    let text = format!("branch #{} failed: {}", branch.id, e.kind);
                    if let Err(send_err) = outbound.send(&channel_id, branch.id, &text).await {
                        warn!(error = %send_err, "failed to send failure notice");
                    }
                }
            }
            presence
                .update(running.fetch_sub(1, Ordering::SeqCst).saturating_sub(1))
                .await;
        });
        runtime.manager.attach_task(branch_id, task);
    }

    /// Static prefix for provider calls: agent prompt, injected documents,
    /// and workspace/scope information.
    fn compose_system_prompt(&self, runtime: &AgentRuntime, record: &AgentRecord) -> String {
        let mut prompt = runtime.paths.read_system_prompt();
        if prompt.is_empty() {
            prompt = format!("You are the agent named {}.", record.name);
        }
        let docs = runtime.paths.read_docs();
        if !docs.is_empty() {
            prompt.push_str("\n\n# Documents\n");
            prompt.push_str(&docs);
        }
        prompt.push_str(&format!(
            "\n\n# Environment\nworkspace: {}\nmodel: {}\n",
            runtime.paths.workspace().display(),
            record.model
        ));
        prompt
    }

    // ── Tool requests ───────────────────────────────────────────────────

    pub async fn handle_request(&self, request: OrchestratorRequest) {
        match request {
            OrchestratorRequest::SendToAgent { from, target, message, reply } => {
                let result = match self.agent(&target) {
                    Some(runtime) => {
                        let seed = format!("Message from agent '{from}': {message}");
                        // The target runs this under its own profile; the
                        // sending agent's permissions never transfer.
                        let branch = runtime.manager.create_branch(&seed, None, 0);
                        self.persist_user_message(&runtime, branch.id, &seed);
                        self.spawn_loop(&runtime, branch, InvokingUser::default());
                        Ok(())
                    }
                    None => Err(format!("no agent named '{target}'")),
                };
                let _ = reply.send(result);
            }
            OrchestratorRequest::ReadAgentDocs { target, reply } => {
                let result = match self.agent(&target) {
                    Some(runtime) => Ok(runtime.paths.read_docs()),
                    None => Err(format!("no agent named '{target}'")),
                };
                let _ = reply.send(result);
            }
            OrchestratorRequest::ListAgents { reply } => {
                let _ = reply.send(self.agent_names());
            }
        }
    }

    // ── Hook effects ────────────────────────────────────────────────────

    pub async fn handle_effect(&self, effect: HookEffect) {
        match effect {
            HookEffect::StopProcess { pid } => {
                if let Err(e) = self.processes.kill(pid).await {
                    warn!(pid, error = %e, "hook-requested kill failed");
                }
            }
            HookEffect::StopBranch { agent, branch } => {
                if let Some(runtime) = self.agent(&agent) {
                    runtime.manager.kill(branch);
                }
            }
            HookEffect::InjectContext { agent, branch, text } => {
                if let Some(runtime) = self.agent(&agent)
                    && let Some(branch) = runtime.manager.get(branch)
                    && branch.status().is_live()
                {
                    branch.inject_queue.push(text);
                }
            }
            HookEffect::SpawnBranch(request) => self.spawn_from_hook(request).await,
        }
    }

    async fn spawn_from_hook(&self, request: SpawnBranchRequest) {
        if request.recursion_depth > self.config.hooks.max_depth {
            warn!(
                agent = %request.agent,
                depth = request.recursion_depth,
                "rejecting hook spawn beyond depth limit"
            );
            return;
        }
        let in_flight = self.hook_spawns.load(Ordering::SeqCst);
        if in_flight >= self.config.hooks.max_in_flight {
            warn!(in_flight, "rejecting hook spawn: too many in flight");
            return;
        }
        let Some(runtime) = self.agent(&request.agent) else {
            warn!(agent = %request.agent, "hook spawn for unknown agent");
            return;
        };

        let mut seed = request.instruction.clone();
        if !request.process_context.is_null()
            && request.process_context.as_object().is_some_and(|o| !o.is_empty())
        {
            seed.push_str(&format!("\n\nProcess context: {}", request.process_context));
        }
        if !request.output_tail.is_empty() {
            seed.push_str(&format!("\n\nRecent output:\n{}", request.output_tail));
        }

        info!(
            agent = %request.agent,
            depth = request.recursion_depth,
            "spawning branch from process hook"
        );
        let branch = runtime.manager.create_branch(
            &seed,
            request.parent_branch,
            request.recursion_depth,
        );
        self.persist_user_message(&runtime, branch.id, &seed);

        // Track in-flight hook spawns; the slot frees when the loop settles.
        self.hook_spawns.fetch_add(1, Ordering::SeqCst);
        // Hook branches run under the agent's normal profile, never elevated.
        self.spawn_loop(&runtime, Arc::clone(&branch), InvokingUser::default());

        let spawns = Arc::clone(&self.hook_spawns);
        let manager = Arc::clone(&runtime.manager);
        let id = branch.id;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                match manager.get(id) {
                    Some(b) if b.status().is_live() => continue,
                    _ => break,
                }
            }
            spawns.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
