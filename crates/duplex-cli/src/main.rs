//! Terminal call client.
//!
//! `duplex-cli listen` waits for calls and answers them; `duplex-cli call <id>`
//! dials a peer announced by another client on the same relay.

mod events;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duplex_core::application::ports::PathStatus;
use duplex_core::PeerId;

use events::{CliCallEvents, UiEvent};
use state::{load_config, CliSession};

#[derive(Debug, Parser)]
#[command(name = "duplex-cli", version, about = "Place and answer duplex calls")]
struct Args {
    /// Signaling relay address.
    #[arg(long, default_value = "127.0.0.1:4433")]
    relay: SocketAddr,
    /// Session config in TOML.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Send video as well as audio.
    #[arg(long)]
    video: bool,
    /// Simulated packet loss fraction applied once connected.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wait for incoming calls and answer them.
    Listen,
    /// Call a peer by its numeric id.
    Call {
        peer: u64,
        /// Hang up after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let (events, mut ui) = CliCallEvents::new();
    let session = CliSession::build(config, args.relay, Arc::new(events))?;
    session.path.set(PathStatus::Satisfied);

    let me = session.manager.connect().await?;
    info!(id = me.0, "Connected to relay as {me}");

    let listening = matches!(args.command, Command::Listen);
    let hang_up_after = match args.command {
        Command::Listen => None,
        Command::Call { peer, duration } => {
            session.manager.start_call(PeerId(peer), args.video).await?;
            duration.map(Duration::from_secs)
        }
    };

    loop {
        tokio::select! {
            event = ui.recv() => match event {
                Some(UiEvent::Incoming(from)) => {
                    info!(%from, "Answering");
                    if let Err(e) = session.manager.answer_call(args.video).await {
                        warn!("Answer failed: {e}");
                    }
                }
                Some(UiEvent::Started(peer)) => {
                    if args.loss > 0.0 {
                        info!(%peer, loss = args.loss, "Simulating packet loss");
                        session.set_loss(args.loss);
                    }
                    if let Some(after) = hang_up_after {
                        tokio::time::sleep(after).await;
                        session.manager.end_call().await?;
                    }
                }
                Some(UiEvent::Ended { failed }) => {
                    if !listening {
                        session.manager.shutdown().await;
                        if failed {
                            anyhow::bail!("call failed");
                        }
                        return Ok(());
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Hanging up");
                break;
            }
        }
    }

    session.manager.shutdown().await;
    Ok(())
}
