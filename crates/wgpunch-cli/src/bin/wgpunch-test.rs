//! Interactive hole-punching tester
//!
//! Drives the punching engine directly, with no rendezvous server and
//! no WireGuard device: two operators run it against each other's
//! public IPs and read the results off their terminals.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;
use wgpunch_nat::{guess_local_port, guess_remote_port, simple_test, stun, RemoteGuessConfig};

/// NAT class on this side of the test.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum NatSide {
    /// Endpoint-independent mapping: search the peer's port
    Easy,
    /// Destination-dependent mapping: search our own local port
    Hard,
}

/// Exercise UDP hole punching against a cooperating remote tester
#[derive(Parser)]
#[command(name = "wgpunch-test", version, about)]
struct Cli {
    /// NAT class on this side; omit to run the fixed-port test
    #[arg(long = "nat", value_enum)]
    nat: Option<NatSide>,

    /// Remote peer, `IP` for --nat easy, `IP:PORT` for --nat hard
    remote: String,
}

fn remote_ip(remote: &str) -> anyhow::Result<IpAddr> {
    remote
        .parse::<IpAddr>()
        .or_else(|_| remote.parse::<SocketAddr>().map(|addr| addr.ip()))
        .with_context(|| format!("invalid remote address {remote:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.nat {
        Some(NatSide::Easy) => {
            let ip = remote_ip(&cli.remote)?;
            let config = RemoteGuessConfig {
                interactive: true,
                ..RemoteGuessConfig::default()
            };
            let port = guess_remote_port(ip, config).await?;
            println!("Remote addr: {ip}:{port}");
        }
        Some(NatSide::Hard) => {
            let peer: SocketAddr = cli
                .remote
                .parse()
                .with_context(|| format!("--nat hard needs IP:PORT, got {:?}", cli.remote))?;
            let port = guess_local_port(peer).await?;
            println!("Local addr: :{port}");
        }
        None => {
            let ip = remote_ip(&cli.remote)?;
            let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
            let public = stun::query(&socket, stun::STUN_GOOGLE).await?;
            println!("{} -> {public}", socket.local_addr()?);

            println!("Enter remote port:");
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
            let port: u16 = line.trim().parse().context("invalid port")?;

            simple_test(socket, SocketAddr::new(ip, port), format!("Hello from {public}!")).await?;
        }
    }

    Ok(())
}
