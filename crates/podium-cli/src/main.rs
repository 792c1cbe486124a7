use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{info, warn};

use podium_backplane::{BackplaneOptions, RealtimeBackplane, TransportKind};
use podium_core::config::Config;
use podium_core::protocol::validate_text;
use podium_relay::RelayState;
use podium_session::{IdentityStore, LocalIdentity, SessionStateStore, SessionSync};

mod commands;
mod logging;

use commands::HostCommand;

#[derive(Parser)]
#[command(
    name = "podium",
    about = "Live presentation sync: one host, many students",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the websocket relay
    Relay {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Present: read commands from stdin and push state to students
    Host {
        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Follow a host and log every applied state
    Student {
        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Validate an envelope from a file, or `-` for stdin
    Validate { input: String },

    /// Query a running relay's health endpoint
    Status {
        /// Relay port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(clap::Args)]
struct SyncArgs {
    /// Session name (default: from config)
    #[arg(long)]
    session: Option<String>,

    /// Realtime endpoint; `{session}` is replaced with the session name
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Get a config value by dotted path
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init_logging(config.logging.as_ref(), cli.verbose);

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        warn!("Config: {warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("Invalid config {}: {}", config_path.display(), errors.join("; "));
    }

    match cli.command {
        Commands::Relay { port } => {
            let port = port.unwrap_or_else(|| config.relay_port());
            info!("Starting Podium relay on port {port}");
            let state = Arc::new(RelayState::new(&config));
            podium_relay::start_relay(state, port).await?;
        }
        Commands::Host { sync } => {
            let sync = build_sync(&config, &sync, LocalIdentity::host());
            run_host(&sync).await?;
        }
        Commands::Student { sync } => {
            let sync = build_sync(&config, &sync, LocalIdentity::student());
            run_student(&sync).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at `{key}`"),
            },
        },
        Commands::Validate { input } => {
            let raw = if input == "-" {
                let mut raw = String::new();
                tokio::io::stdin().read_to_string(&mut raw).await?;
                raw
            } else {
                tokio::fs::read_to_string(&input).await?
            };
            match validate_text(&raw) {
                Ok(envelope) => {
                    println!("{}", serde_json::to_string_pretty(&envelope.to_value()?)?);
                }
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e)?);
                    anyhow::bail!("{e}");
                }
            }
        }
        Commands::Status { port } => {
            let port = port.unwrap_or_else(|| config.relay_port());
            let url = format!("http://127.0.0.1:{port}/health");
            match reqwest::get(&url).await {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Podium v{}", env!("CARGO_PKG_VERSION"));
                    println!("Config: {}", config_path.display());
                    println!("Relay: {}", serde_json::to_string_pretty(&body)?);
                }
                Err(e) => {
                    println!("Relay at {url} is not reachable: {e}");
                }
            }
        }
    }

    Ok(())
}

/// Fill `{session}` in an endpoint template.
fn session_endpoint(endpoint: &str, session: &str) -> String {
    endpoint.replace("{session}", session)
}

fn build_sync(config: &Config, args: &SyncArgs, identity: LocalIdentity) -> SessionSync {
    let session = args.session.clone().unwrap_or_else(|| config.session_name());
    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| config.sync_endpoint())
        .map(|e| session_endpoint(&e, &session));

    let backplane = RealtimeBackplane::new(BackplaneOptions {
        endpoint,
        hub: None,
        channel_name: format!("{}:{session}", config.channel_name()),
    });
    info!(%session, role = %identity.effective_role(), "Joining session");

    SessionSync::new(
        backplane,
        Arc::new(SessionStateStore::default()),
        Arc::new(IdentityStore::new(identity)),
    )
}

fn report_transport(transport: TransportKind) {
    if transport == TransportKind::None {
        warn!("No realtime transport; set --endpoint or sync.endpoint to reach other peers");
    }
}

async fn run_host(sync: &SessionSync) -> anyhow::Result<()> {
    report_transport(sync.start()?);
    println!("Commands: next | prev | goto N | zoom Z | pan X Y | laser X Y | laser off | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match HostCommand::parse(&line) {
                    Ok(HostCommand::Quit) => break,
                    Ok(command) => {
                        if command.apply(sync.state()) {
                            let state = sync.state().snapshot();
                            info!(
                                step = state.global_step,
                                zoom = state.shared_viewport.zoom_level,
                                "State changed"
                            );
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                }
            }
        }
    }

    sync.stop().await;
    Ok(())
}

async fn run_student(sync: &SessionSync) -> anyhow::Result<()> {
    let mut view = sync.state().subscribe();
    report_transport(sync.start()?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = view.borrow_and_update().clone();
                let host = sync
                    .state()
                    .remote_presence()
                    .map(|p| p.source_id.to_string())
                    .unwrap_or_default();
                info!(
                    %host,
                    step = state.global_step,
                    zoom = state.shared_viewport.zoom_level,
                    pan_x = state.shared_viewport.pan_offset.x,
                    pan_y = state.shared_viewport.pan_offset.y,
                    laser = ?state.laser_position,
                    "Applied host state"
                );
            }
        }
    }

    sync.stop().await;
    Ok(())
}
