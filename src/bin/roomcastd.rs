//! roomcast daemon - room broker, relay and WebSocket server
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground, default command)
//! roomcastd start
//!
//! # Start with a config file and a different listen address
//! roomcastd --config /etc/roomcast.toml start --listen 127.0.0.1:9000
//!
//! # Validate a config file and print the effective settings
//! roomcastd --config /etc/roomcast.toml check-config
//!
//! # Enable debug logging
//! RUST_LOG=roomcastd=debug roomcastd start
//! ```
//!
//! # Environment
//!
//! - `ROOMCAST_CONFIG`: config file path (overridden by `--config`)
//! - `ROOMCAST_LISTEN`: listen address (overridden by `--listen`)
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use roomcast_core::Config;
use roomcastd::{spawn_broker, spawn_relay, RoomcastServer};

/// How long to wait for the broker, relay and open connections after the
/// server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// roomcast daemon - WebSocket rooms and relay
#[derive(Parser, Debug)]
#[command(name = "roomcastd", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server in the foreground
    Start {
        /// Address to listen on (e.g. 0.0.0.0:8080)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Validate the configuration and print it as TOML
    CheckConfig,
}

/// Loads configuration from defaults, file, environment and flags.
fn load_config(path: Option<PathBuf>, listen: Option<String>) -> Result<Config> {
    let path = path.or_else(|| env::var_os("ROOMCAST_CONFIG").map(PathBuf::from));

    let mut config = match &path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Ok(addr) = env::var("ROOMCAST_LISTEN") {
        config.listen = addr;
    }
    if let Some(addr) = listen {
        config.listen = addr;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Start { listen: None }) {
        Command::Start { listen } => {
            let config = load_config(args.config, listen)?;
            run_daemon(config)
        }
        Command::CheckConfig => {
            let config = load_config(args.config, None)?;
            let rendered = config
                .to_toml_string()
                .context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("roomcastd=info".parse()?)
                .add_directive("roomcast_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "roomcast daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let broker = spawn_broker(&config.broker, cancel_token.clone());
    info!("Broker started");

    let relay = spawn_relay(&config.relay, cancel_token.clone());
    info!(endpoints = config.relay.endpoints.len(), "Relay started");

    let server = RoomcastServer::bind(config, broker.clone(), relay.clone(), cancel_token.clone())
        .await
        .context("Failed to start server")?;
    let connections = server.connections();

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        cancel_token.cancel();
        return Err(e.into());
    }

    // The server only returns on shutdown, but make sure the actors follow.
    cancel_token.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        broker.stopped().await;
        relay.stopped().await;
        // Closing sinks ends each writer with a goodbye; let those flush.
        connections.wait().await;
    })
    .await;

    if drained.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            open_connections = connections.len(),
            "Shutdown did not finish within the grace period"
        );
    }

    info!("roomcast daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
