//! Standalone signaling relay binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use duplex_core::adapters::quic::server::SignalingRelay;

#[derive(Debug, Parser)]
#[command(name = "duplex-relay", version, about = "QUIC signaling relay for duplex calls")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:4433")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(addr = %args.bind, "Signaling relay starting");
    let relay = Arc::new(SignalingRelay::new(args.bind)?);

    tokio::select! {
        result = Arc::clone(&relay).run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            relay.close();
            Ok(())
        }
    }
}
