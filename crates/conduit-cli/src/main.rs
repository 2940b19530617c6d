//! `conduit` binary: wires the Message Gateway, Session Manager, Reasoning
//! Engine, Tool Executor, Scheduler and (optionally) the Master-Worker
//! orchestrator into one running process, with a stdin/stdout adapter so
//! the agent core can be exercised without a real chat backend.
//!
//! Run in master/local mode by default. Pass `--agent-id <id>` to run as a
//! worker process instead (spawned by a master with `worker.enabled = true`
//! in config), connecting to the bus and executing `run_task` commands.

mod brain;
mod cli_channel;
mod scheduler_handler;
mod sse_channel;
mod tools;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use conduit_agent::executor::ToolExecutor;
use conduit_agent::monitor::{MonitorConfig, TaskMonitor};
use conduit_channels::ChannelManager;
use conduit_core::config::ConduitConfig;
use conduit_gateway::{GatewayInterrupts, InterruptQueues, MessageGateway};
use conduit_observability::Tracer;
use conduit_orchestrator::{GatewayAgentHandler, Orchestrator, OrchestratorDeps};
use conduit_scheduler::SchedulerEngine;
use conduit_sessions::SessionManager;
use conduit_worker::MasterAgent;

#[derive(Parser, Debug)]
#[command(name = "conduit", about = "Agent execution core")]
struct Args {
    /// Path to conduit.toml (defaults to ~/.conduit/conduit.toml).
    #[arg(long)]
    config: Option<String>,

    /// Run as a worker process with this agent id instead of the
    /// interactive master process.
    #[arg(long)]
    agent_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "conduit=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ConduitConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        ConduitConfig::default()
    });

    if let Some(agent_id) = args.agent_id {
        return run_worker(config, agent_id).await;
    }
    run_master(config).await
}

async fn run_master(config: ConduitConfig) -> anyhow::Result<()> {
    let sessions = Arc::new(SessionManager::load(config.data.sessions_file(), config.session.clone())?);
    let scheduler = Arc::new(SchedulerEngine::load(
        config.data.tasks_file(),
        config.data.executions_file(),
        config.scheduler.clone(),
    )?);
    let tracer = Arc::new(Tracer::new(config.data.traces_dir()));

    let executor = Arc::new(ToolExecutor::new(1, false));
    executor.register("echo", Arc::new(tools::EchoTool));
    executor.register("shell_exec", Arc::new(tools::ShellExecTool::default()));

    let monitor_config = MonitorConfig {
        fallback_model: config.reasoning.fallback_model.clone().unwrap_or_else(|| "fallback".to_string()),
        ..MonitorConfig::default()
    };
    let monitor = Arc::new(TaskMonitor::new(monitor_config));

    let master = if config.worker.enabled {
        let current_exe = std::env::current_exe()?.to_string_lossy().to_string();
        match MasterAgent::new(
            current_exe,
            config.worker.min_workers,
            config.worker.max_workers,
            &config.worker.command_endpoint,
            &config.worker.event_endpoint,
        ) {
            Ok(master) => {
                let master = Arc::new(master);
                master.ensure_min_workers();
                Some(master)
            }
            Err(e) => {
                warn!(error = %e, "failed to start master-worker bus, falling back to single-process mode");
                None
            }
        }
    } else {
        None
    };

    let deps = OrchestratorDeps {
        brain: Arc::new(brain::PlaceholderBrain::new(&config.reasoning.model, 200_000, 8_192)),
        executor,
        monitor,
        tools: tools::tool_specs(),
        system_prompt: "你是一个多渠道、可使用工具的智能助手。".to_string(),
        default_model: config.reasoning.model.clone(),
        tracer,
        master,
    };

    let mut channel_manager = ChannelManager::new();
    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel(config.gateway.queue_capacity);
    channel_manager.register(Box::new(cli_channel::CliChannel::new()), inbound_tx.clone());
    channel_manager.register(
        Box::new(sse_channel::HttpSseChannel::new(config.gateway.bind.clone(), config.gateway.port)),
        inbound_tx,
    );
    channel_manager.start_all().await;
    let channels = Arc::new(channel_manager);

    let shared_interrupts = Arc::new(InterruptQueues::new());
    let interrupts = Arc::new(GatewayInterrupts { channels: channels.clone(), queues: shared_interrupts.clone() });

    let orchestrator = Arc::new(Orchestrator::new(deps, interrupts));
    let handler = Arc::new(GatewayAgentHandler::new(orchestrator, conduit_agent::SessionType::Cli));

    let gateway = Arc::new(MessageGateway::new(channels.clone(), sessions.clone(), handler.clone(), shared_interrupts));
    handler.bind_gateway(Arc::downgrade(&gateway));

    tokio::spawn(conduit_sessions::run_save_loop(sessions.clone(), config.session.save_delay_seconds));
    tokio::spawn(conduit_sessions::run_cleanup_loop(sessions.clone(), config.session.cleanup_interval_seconds));

    let scheduler_handler: Arc<dyn conduit_scheduler::TaskHandler> =
        Arc::new(scheduler_handler::ReminderTaskHandler { channels: channels.clone() });
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(scheduler.clone().run(scheduler_handler, shutdown_rx));

    info!("conduit agent core running, type a message and press enter");
    while let Some(message) = inbound_rx.recv().await {
        if let Err(e) = gateway.dispatch(message).await {
            warn!(error = %e, "failed to dispatch inbound message");
        }
    }

    Ok(())
}

/// Worker-process entrypoint: connects to the master's bus and executes
/// `run_task` commands it's dispatched, reporting results back as
/// `response` envelopes.
async fn run_worker(config: ConduitConfig, agent_id: String) -> anyhow::Result<()> {
    use conduit_core::AgentId;
    use conduit_worker::{BusEnvelope, BusMessageType, WorkerBus};

    info!(agent_id, "starting worker process");
    let bus = WorkerBus::connect(&config.worker.command_endpoint, &config.worker.event_endpoint)?;
    let self_id = AgentId::new(agent_id.clone());

    let executor = Arc::new(ToolExecutor::new(1, false));
    executor.register("echo", Arc::new(tools::EchoTool));
    executor.register("shell_exec", Arc::new(tools::ShellExecTool::default()));
    let monitor = Arc::new(TaskMonitor::new(MonitorConfig::default()));
    let tracer = Arc::new(Tracer::new(config.data.traces_dir()));

    let deps = OrchestratorDeps {
        brain: Arc::new(brain::PlaceholderBrain::new(&config.reasoning.model, 200_000, 8_192)),
        executor,
        monitor,
        tools: tools::tool_specs(),
        system_prompt: "你是一个多渠道、可使用工具的智能助手。".to_string(),
        default_model: config.reasoning.model.clone(),
        tracer,
        master: None,
    };
    struct NoInterrupts;
    #[async_trait::async_trait]
    impl conduit_agent::InterruptSource for NoInterrupts {
        async fn send_question(&self, _session_key: &str, _question: &str) {}
        async fn send_reminder(&self, _session_key: &str) {}
        async fn poll_reply(&self, _session_key: &str, _wait: std::time::Duration) -> Option<String> {
            None
        }
    }
    let orchestrator = Orchestrator::new(deps, Arc::new(NoInterrupts));

    let sessions = Arc::new(SessionManager::load(config.data.sessions_file(), config.session.clone())?);

    let mut recv = bus.spawn_recv_loop();
    while let Some(envelope) = recv.recv().await {
        if envelope.msg_type != BusMessageType::Command {
            continue;
        }
        let text = envelope
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let session = sessions
            .get_session(
                &conduit_core::ChannelId::new("worker"),
                &conduit_core::ChatId::from(agent_id.as_str()),
                &conduit_core::UserId::from("worker"),
                true,
            )?
            .expect("create_if_missing=true always yields a session");

        let reply = orchestrator.handle_request(&session, text, conduit_agent::SessionType::Cli).await;

        let mut response = BusEnvelope::heartbeat(self_id.clone());
        response.msg_type = BusMessageType::Response;
        response.correlation_id = Some(envelope.msg_id.clone());
        response.payload = serde_json::json!({ "text": reply });
        bus.send(&response).await?;
    }

    Ok(())
}
