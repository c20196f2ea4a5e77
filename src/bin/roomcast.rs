//! roomcast - command-line client for the roomcast daemon
//!
//! # Usage
//!
//! ```bash
//! # Chat in a room: stdin lines are sent, received text is printed
//! roomcast chat ws://localhost:8080/lobby
//!
//! # Print frames pushed to an outbound relay endpoint
//! roomcast listen ws://localhost:8080/feed
//!
//! # Stream stdin lines as binary frames to an inbound relay endpoint
//! roomcast send ws://localhost:8080/ingest
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use roomcast_core::Payload;
use roomcastd::{dial, ClientConnection, ClientFraming, ClientMode};

/// Buffer between stdin and the websocket writer.
const STDIN_BUFFER: usize = 100;

/// roomcast client
#[derive(Parser, Debug)]
#[command(name = "roomcast", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room: send stdin lines, print what others say
    Chat {
        /// Room URL, e.g. ws://localhost:8080/lobby
        url: String,
    },
    /// Print frames from an outbound relay endpoint
    Listen {
        /// Endpoint URL, e.g. ws://localhost:8080/feed
        url: String,
    },
    /// Send stdin lines as binary frames to an inbound relay endpoint
    Send {
        /// Endpoint URL, e.g. ws://localhost:8080/ingest
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("roomcastd=warn".parse()?)
                .add_directive("roomcast=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Chat { url } => {
            let (tx, rx) = mpsc::channel(STDIN_BUFFER);
            let connection = dial(&url, ClientMode::Duplex, ClientFraming::AsIs, Some(rx))
                .await
                .context("Failed to join room")?;
            tokio::spawn(forward_stdin(tx, false));
            print_inbound(connection).await
        }
        Command::Listen { url } => {
            let connection = dial(&url, ClientMode::Receive, ClientFraming::AsIs, None)
                .await
                .context("Failed to connect to relay endpoint")?;
            print_inbound(connection).await
        }
        Command::Send { url } => {
            let (tx, rx) = mpsc::channel(STDIN_BUFFER);
            let connection = dial(&url, ClientMode::Send, ClientFraming::Binary, Some(rx))
                .await
                .context("Failed to connect to relay endpoint")?;
            forward_stdin(tx, true).await;
            connection
                .task
                .await
                .context("Connection task failed")?;
            Ok(())
        }
    }
}

/// Sends each stdin line until EOF or until the connection goes away.
async fn forward_stdin(tx: mpsc::Sender<Payload>, binary: bool) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        let payload = if binary {
            Payload::Binary(line.into_bytes())
        } else {
            Payload::Text(line)
        };
        if tx.send(payload).await.is_err() {
            break;
        }
    }
}

/// Prints received frames, one per line, until the connection ends.
async fn print_inbound(mut connection: ClientConnection) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(payload) = connection.inbound.recv().await {
        let line = match payload {
            Payload::Text(text) => text,
            Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };
        stdout
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context("Failed to write to stdout")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }
    connection.cancel.cancel();
    let _ = connection.task.await;
    Ok(())
}
