//! wgpunch rendezvous server
//!
//! Serves the presence table and the websocket wake-up channel. All
//! state is in memory; restarting the server loses nothing that a
//! peer's next publish would not recreate within a TTL.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wgpunch_rendezvous::{RendezvousServer, ServerConfig};

/// Rendezvous server for wgpunch peers
#[derive(Parser)]
#[command(name = "wgpunch-server", version, about)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Presence entry lifetime in seconds
    #[arg(long, default_value_t = 20)]
    ttl_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let server = RendezvousServer::new(ServerConfig {
        bind_addr: cli.listen,
        presence_ttl: Duration::from_secs(cli.ttl_secs),
        ..ServerConfig::default()
    });

    server.run().await;
}
