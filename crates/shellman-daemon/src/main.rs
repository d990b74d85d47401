use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use shellman_core::input::InputTracker;
use shellman_daemon::agent::{agent_ws_url, run_agent_loop, AgentDeps};
use shellman_daemon::autorun::ReadyAutoRunner;
use shellman_daemon::baseline::load_baselines;
use shellman_daemon::config::{Config, Mode};
use shellman_daemon::gateway::GatewayClient;
use shellman_daemon::hub::{run_hub, Hub};
use shellman_daemon::lifecycle::Lifecycle;
use shellman_daemon::mux::{FrameSink, SharedSink};
use shellman_daemon::pane::PaneActorOptions;
use shellman_daemon::registry::{Registry, RegistryDeps, RegistryOptions};
use shellman_daemon::status_pump::{StatusPump, StatusPumpOptions};
use shellman_daemon::taskstate::{TaskStateActor, TaskStateOptions};
use shellman_daemon::tools::{register_builtin_tools, ToolDeps};
use shellman_llm::action::{ActionLoop, ActionLoopOptions};
use shellman_llm::http::HttpResponsesClient;
use shellman_llm::tool::ToolRegistry;
use shellman_store::Store;
use shellman_tmux::{ControlModeHub, RealTmux, TmuxExecutor, TmuxFacade};

#[derive(Parser)]
#[command(name = "shellman", about = "Bridge tmux panes to web clients with task tracking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent daemon (default when no subcommand is given).
    Daemon {
        /// SQLite database path.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Turn id the agent serves.
        #[arg(long, default_value = "local")]
        turn_id: String,
    },
    /// Print persisted pane runtime status.
    Status {
        /// SQLite database path.
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn default_db_path() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".shellman").join("shellman.db"),
        Err(_) => PathBuf::from("shellman.db"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        None => run_daemon(config, default_db_path(), "local".to_owned()).await,
        Some(Commands::Daemon { db, turn_id }) => {
            run_daemon(config, db.unwrap_or_else(default_db_path), turn_id).await
        }
        Some(Commands::Status { db }) => run_status(db.unwrap_or_else(default_db_path)),
    }
}

async fn run_daemon(config: Config, db_path: PathBuf, turn_id: String) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Mutex::new(Store::open(&db_path)?));
    let baselines = load_baselines(&store);

    let exec = match &config.tmux_socket {
        Some(socket) => TmuxExecutor::with_socket(socket.clone()),
        None => TmuxExecutor::new(),
    };
    let tmux: Arc<dyn TmuxFacade> = Arc::new(RealTmux::new(exec.clone()));
    let input_tracker = Arc::new(Mutex::new(InputTracker::new()));

    let root = CancellationToken::new();
    let mut lifecycle = Lifecycle::new(root.clone());
    // Teardown order: socket loops and writers first, then pane actors,
    // control children, the pumps, and finally the store (dropped last).
    let agent_token = lifecycle.stage("agent");
    let registry_token = lifecycle.stage("registry");
    let control_token = lifecycle.stage("control-hub");
    let pump_token = lifecycle.stage("status-pump");
    let taskstate_token = lifecycle.stage("task-state");

    let control_hub = Arc::new(ControlModeHub::new(exec.clone(), control_token.clone()));

    // Optional LLM action loop for ready-edge auto progression.
    let action = if !config.llm_endpoint.is_empty() && !config.llm_model.is_empty() {
        let client = Arc::new(HttpResponsesClient::new(
            config.llm_endpoint.clone(),
            config.llm_api_key.clone(),
        ));
        let mut tools = ToolRegistry::new();
        register_builtin_tools(
            &mut tools,
            &ToolDeps {
                tmux: Arc::clone(&tmux),
                store: Arc::clone(&store),
                input_tracker: Arc::clone(&input_tracker),
                raw_shell_mode: Arc::new(|| false),
            },
        )?;
        Some(Arc::new(ActionLoop::new(
            client,
            Arc::new(tools),
            ActionLoopOptions::new(config.llm_model.clone()),
        )))
    } else {
        None
    };
    let executor = ReadyAutoRunner::new(Arc::clone(&store), action, None);

    let (report_tx, report_rx) = tokio::sync::mpsc::unbounded_channel();
    let shared_sink = Arc::new(SharedSink::new());

    let registry = Registry::new(
        RegistryDeps {
            tmux: Arc::clone(&tmux),
            hub: Some(Arc::clone(&control_hub)),
            executor: Some(executor),
            report_tx: Some(report_tx),
            input_tracker: Arc::clone(&input_tracker),
            baselines: baselines.clone(),
            sink: Arc::clone(&shared_sink) as Arc<dyn FrameSink>,
        },
        RegistryOptions {
            pane: PaneActorOptions {
                history_lines: config.history_lines,
                ..PaneActorOptions::default()
            },
            ..RegistryOptions::default()
        },
        registry_token,
    );
    registry.start_discovery();

    // Status pump.
    let pump = StatusPump::new(
        Arc::clone(&tmux),
        Arc::clone(&registry),
        Arc::clone(&input_tracker),
        baselines,
        StatusPumpOptions::default(),
    );
    lifecycle.attach("status-pump", tokio::spawn(pump.run(pump_token)));

    // Task-state actor.
    let taskstate = TaskStateActor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        TaskStateOptions::default(),
    );
    lifecycle.attach(
        "task-state",
        tokio::spawn(taskstate.run(report_rx, taskstate_token)),
    );

    // Local mode runs the ws hub in-process.
    if config.mode == Mode::Local {
        let listener = TcpListener::bind(config.local_addr()).await?;
        let hub = Hub::new();
        let hub_token = agent_token.clone();
        tokio::spawn(async move {
            if let Err(e) = run_hub(listener, hub, hub_token).await {
                tracing::error!(error = %e, "ws hub failed");
            }
        });
    }

    let hub_base = match config.mode {
        Mode::Local => config.local_addr(),
        Mode::Turn => config.worker_base_url.clone(),
    };
    let agent_deps = Arc::new(AgentDeps {
        registry: Arc::clone(&registry),
        tmux: Arc::clone(&tmux),
        gateway: (!config.worker_base_url.is_empty())
            .then(|| GatewayClient::new(config.worker_base_url.clone())),
        input_tracker: Arc::clone(&input_tracker),
    });
    lifecycle.attach(
        "agent",
        tokio::spawn(run_agent_loop(
            agent_ws_url(&hub_base, &turn_id),
            agent_deps,
            shared_sink,
            agent_token,
        )),
    );

    tracing::info!(
        db = %db_path.display(),
        turn_id,
        addr = %config.local_addr(),
        "shellman daemon running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    control_hub.shutdown();
    lifecycle.shutdown().await;
    Ok(())
}

fn run_status(db_path: PathBuf) -> anyhow::Result<()> {
    let store = Store::open(&db_path)?;
    let rows = store.list_pane_runtime()?;
    if rows.is_empty() {
        println!("no pane runtime state recorded");
        return Ok(());
    }
    println!(
        "{:<20} {:<10} {:<16} {}",
        "TARGET", "STATUS", "COMMAND", "UPDATED"
    );
    for row in rows {
        println!(
            "{:<20} {:<10} {:<16} {}",
            row.pane_target,
            row.runtime_status,
            row.current_command,
            row.updated_at.to_rfc3339(),
        );
    }
    Ok(())
}
