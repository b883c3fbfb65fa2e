//! Headless CLI for the agent runtime.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chorus::config::{AppConfig, load_default_config};
use chorus::gateway::{AskOutcome, AskRequest, Gateway};
use chorus::orchestrator::Orchestrator;
use chorus::process::ProcessManager;
use chorus::status::start_outbound;
use chorus::store::Store;

#[derive(Parser)]
#[command(name = "chorus", about = "Channel-bound multi-agent runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the runtime and serve bound channels.
    Run,
    /// Inspect configured agents.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Inspect or stop tracked processes.
    Process {
        #[command(subcommand)]
        action: ProcessAction,
    },
    /// List saved session snapshots.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List all agents with their channels and models.
    List,
}

#[derive(Subcommand)]
enum ProcessAction {
    /// List tracked processes.
    List {
        /// Only show processes of this agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Stop a tracked process (SIGTERM, then SIGKILL).
    Kill { pid: u32 },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List saved snapshots, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Stand-in transport used until a real chat-service adapter is attached:
/// logs outbound traffic and denies every approval prompt.
struct LoggingGateway;

#[async_trait::async_trait]
impl Gateway for LoggingGateway {
    async fn send(&self, channel_id: &str, text: &str) -> Result<String, String> {
        info!(channel = channel_id, %text, "outbound message");
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn edit(&self, channel_id: &str, message_id: &str, text: &str) -> Result<(), String> {
        info!(channel = channel_id, message = message_id, %text, "edit");
        Ok(())
    }

    async fn ask(&self, request: &AskRequest) -> AskOutcome {
        info!(action = %request.action, "approval requested with no interactive gateway; denying");
        AskOutcome::Denied
    }

    async fn set_presence(&self, _active_branches: usize) {}
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CHORUS_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_default_config();

    let result = match cli.command {
        Command::Run => run(config).await,
        Command::Agent { action: AgentAction::List } => agent_list(&config),
        Command::Process { action } => process_cmd(&config, action).await,
        Command::Session { action: SessionAction::List { limit } } => session_list(&config, limit),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), String> {
    let store = Arc::new(Store::open(&config.runtime.home).map_err(|e| e.to_string())?);
    let gateway: Arc<dyn Gateway> = Arc::new(LoggingGateway);

    let api_key = std::env::var(&config.provider.api_key_env).unwrap_or_default();
    let provider = chorus::ai::provider::provider_for(
        &config.provider.default_kind,
        &config.provider.base_url,
        &api_key,
        config.provider.request_timeout_secs,
    )?;

    let (effects_tx, effects_rx) = tokio::sync::mpsc::channel(256);
    let (requests_tx, requests_rx) = tokio::sync::mpsc::channel(256);
    let (_inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(256);

    let processes = Arc::new(ProcessManager::new(
        Arc::clone(&store),
        config.runtime.home.clone(),
        effects_tx,
    ));
    let recovered = processes.recover_on_startup().map_err(|e| e.to_string())?;
    if recovered > 0 {
        info!(recovered, "re-adopted running processes");
    }

    let outbound = start_outbound(Arc::clone(&gateway), config.outbound);
    let orchestrator = Orchestrator::new(
        config,
        store,
        gateway,
        provider,
        Arc::clone(&processes),
        outbound.clone(),
        requests_tx,
    );
    let agents = orchestrator.load_agents().map_err(|e| e.to_string())?;
    info!(agents, "runtime started");

    let runner = tokio::spawn(Arc::clone(&orchestrator).run(inbound_rx, requests_rx, effects_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;
    info!("shutting down; tracked processes keep running");
    // Replies already queued behind the rate limiter still go out.
    outbound.drain().await;
    processes.shutdown();
    runner.abort();
    Ok(())
}

fn agent_list(config: &AppConfig) -> Result<(), String> {
    let store = Store::open(&config.runtime.home).map_err(|e| e.to_string())?;
    let agents = store.list_agents().map_err(|e| e.to_string())?;
    if agents.is_empty() {
        println!("no agents configured");
        return Ok(());
    }
    for a in agents {
        println!(
            "{:<16} channel={:<20} model={:<24} window={}s",
            a.name, a.channel_id, a.model, a.window_seconds
        );
    }
    Ok(())
}

async fn process_cmd(config: &AppConfig, action: ProcessAction) -> Result<(), String> {
    let store = Arc::new(Store::open(&config.runtime.home).map_err(|e| e.to_string())?);
    match action {
        ProcessAction::List { agent } => {
            let rows = store
                .list_processes(agent.as_deref())
                .map_err(|e| e.to_string())?;
            if rows.is_empty() {
                println!("no tracked processes");
                return Ok(());
            }
            for p in rows {
                println!(
                    "{:<8} {:<10} {:<12} exit={:<4} {}",
                    p.pid,
                    p.status,
                    p.agent,
                    p.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    p.command
                );
            }
        }
        ProcessAction::Kill { pid } => {
            let (effects_tx, _effects_rx) = tokio::sync::mpsc::channel(16);
            let manager = ProcessManager::new(store, config.runtime.home.clone(), effects_tx);
            manager.kill(pid).await.map_err(|e| e.to_string())?;
            println!("sent termination to {pid}");
        }
    }
    Ok(())
}

fn session_list(config: &AppConfig, limit: usize) -> Result<(), String> {
    let store = Store::open(&config.runtime.home).map_err(|e| e.to_string())?;
    let rows = store.list_sessions(limit).map_err(|e| e.to_string())?;
    if rows.is_empty() {
        println!("no saved sessions");
        return Ok(());
    }
    for s in rows {
        println!(
            "{}  {}  {:>4} msgs  {}",
            s.timestamp.format("%Y-%m-%d %H:%M"),
            s.session_id,
            s.message_count,
            s.summary
        );
    }
    Ok(())
}
