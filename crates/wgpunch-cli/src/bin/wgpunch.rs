//! wgpunch client
//!
//! Resolves a direct UDP path to the first configured WireGuard peer
//! via the rendezvous server, then reprograms the local device with
//! the punched ports. With `-d` it idles on the push channel instead
//! and runs an attempt whenever the server wakes it.

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wgpunch_cli::{apply_route, resolve_route};
use wgpunch_rendezvous::RendezvousClient;
use wgpunch_wg::WgClient;

/// Punch a WireGuard tunnel through both peers' NATs
#[derive(Parser)]
#[command(name = "wgpunch", version, about)]
struct Cli {
    /// Rendezvous server IP or hostname
    #[arg(short = 's', long = "server")]
    server: String,

    /// WireGuard interface to reprogram
    #[arg(short = 'w', long = "wg-iface")]
    wg_iface: String,

    /// Daemon mode: wait for wake-ups instead of initiating
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let wg = WgClient::new(&cli.wg_iface);
    let rendezvous = RendezvousClient::new(&cli.server);

    let own_pubkey = wg
        .device_public_key()
        .await
        .context("cannot read the device public key")?;

    let peers = wg.peers().await.context("cannot list WireGuard peers")?;
    let Some(first_peer) = peers.first() else {
        bail!("at least one peer required in the WireGuard config");
    };
    let default_peer = first_peer.public_key.clone();

    if cli.daemon {
        let mut wakes = rendezvous
            .subscribe(&own_pubkey)
            .await
            .context("cannot open the push channel")?;
        tracing::info!("daemon mode: waiting for peers to come looking");

        loop {
            let wake = wakes
                .next_wake()
                .await
                .context("push channel lost")?;
            let counterpart = if wake.peer.is_empty() {
                default_peer.clone()
            } else {
                wake.peer
            };
            tracing::info!("woken up for {counterpart}");

            match resolve_route(&rendezvous, &own_pubkey, &counterpart).await {
                Ok(route) => apply_route(&wg, &counterpart, &route).await?,
                // a failed attempt must not kill the daemon
                Err(e) => tracing::error!("peering attempt failed: {e}"),
            }
        }
    }

    let route = resolve_route(&rendezvous, &own_pubkey, &default_peer).await?;
    apply_route(&wg, &default_peer, &route).await?;
    Ok(())
}
