//! Peering orchestration
//!
//! Ties the pieces together for one attempt: open a socket, classify
//! the NAT on it, publish, await the counterpart, pick a punching
//! strategy, and hand the resolved ports to WireGuard.
//!
//! The same socket is used for classification and for the easy side's
//! punching, so the mapping STUN reported is the mapping the peer
//! targets. It is fully released before WireGuard's listen port is
//! reprogrammed, because in the easy case that is the very same port.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use wgpunch_nat::{
    classify, guess_local_port, guess_remote_port, NatKind, PunchError, RemoteGuessConfig,
    StunError, StunInfo, STUN_GOOGLE, STUN_VOIPGATE,
};
use wgpunch_rendezvous::{RendezvousClient, RendezvousError};
use wgpunch_wg::{WgClient, WgError};

/// Anything that can end a peering attempt.
#[derive(Debug, Error)]
pub enum TraversalError {
    /// NAT classification failed
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Hole punching failed
    #[error("hole punching error: {0}")]
    Punch(#[from] PunchError),

    /// Rendezvous exchange failed
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// WireGuard reconfiguration failed
    #[error("WireGuard error: {0}")]
    Wg(#[from] WgError),

    /// The attempt's own UDP socket could not be opened
    #[error("could not open a UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    /// Both sides sit behind port-randomizing NATs; only a relay could
    /// help, which is outside this tool's scope
    #[error("both peers are behind symmetric NAT, hole punching not feasible")]
    BothHardNat,

    /// The counterpart published something unusable
    #[error("peer published a malformed address: {0}")]
    BadPeerAddress(String),
}

/// Which engine (if any) a classified pair needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Both sides easy: published ports are already correct
    Direct,
    /// We are easy, peer is hard: search for the peer's port
    GuessRemotePort,
    /// We are hard, peer is easy: search for our reachable local port
    GuessLocalPort,
}

/// The strategy matrix.
///
/// # Errors
///
/// Returns [`TraversalError::BothHardNat`] for the hard/hard corner.
pub fn select_strategy(own: NatKind, peer: NatKind) -> Result<Strategy, TraversalError> {
    match (own, peer) {
        (NatKind::Hard, NatKind::Hard) => Err(TraversalError::BothHardNat),
        (NatKind::Easy, NatKind::Hard) => Ok(Strategy::GuessRemotePort),
        (NatKind::Hard, NatKind::Easy) => Ok(Strategy::GuessLocalPort),
        (NatKind::Easy, NatKind::Easy) => Ok(Strategy::Direct),
    }
}

/// What the VPN needs to know after a successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchedRoute {
    /// Port the local device must listen on
    pub local_port: u16,
    /// Counterpart's public IP
    pub peer_ip: IpAddr,
    /// Counterpart's reachable public port
    pub peer_port: u16,
}

/// Reflector pair used to classify this peer's NAT.
#[derive(Debug, Clone)]
pub struct ResolveConfig {
    /// First reflector; its port becomes the published one
    pub reflector_a: String,
    /// Second, independently operated reflector
    pub reflector_b: String,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            reflector_a: STUN_GOOGLE.to_string(),
            reflector_b: STUN_VOIPGATE.to_string(),
        }
    }
}

/// Run one peering attempt against `peer_pubkey` with the default
/// reflectors.
///
/// # Errors
///
/// Any [`TraversalError`]; all of them are fatal for the attempt.
pub async fn resolve_route(
    rendezvous: &RendezvousClient,
    own_pubkey: &str,
    peer_pubkey: &str,
) -> Result<PunchedRoute, TraversalError> {
    resolve_route_with(rendezvous, own_pubkey, peer_pubkey, &ResolveConfig::default()).await
}

/// Run one peering attempt against `peer_pubkey`.
///
/// Publishes under `own_pubkey` and waits for the counterpart with no
/// intrinsic bound; callers impose the overall timeout. On return the
/// attempt's socket is closed and the route is ready for
/// [`apply_route`].
///
/// # Errors
///
/// Any [`TraversalError`]; all of them are fatal for the attempt.
pub async fn resolve_route_with(
    rendezvous: &RendezvousClient,
    own_pubkey: &str,
    peer_pubkey: &str,
    config: &ResolveConfig,
) -> Result<PunchedRoute, TraversalError> {
    let socket = Arc::new(
        UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(TraversalError::Bind)?,
    );

    let own = classify(&socket, &config.reflector_a, &config.reflector_b).await?;
    tracing::info!("NAT type: {}", own.nat_kind);
    tracing::info!(
        "{} -> {own}",
        socket.local_addr().map_err(TraversalError::Bind)?
    );

    rendezvous.publish(own_pubkey, &own).await?;
    let peer = rendezvous.wait_for(peer_pubkey, Some(own_pubkey)).await?;
    tracing::info!("peer {peer}");

    let peer_ip: IpAddr = peer
        .public_ip
        .parse()
        .map_err(|_| TraversalError::BadPeerAddress(peer.public_ip.clone()))?;

    let mut local_port = socket.local_addr().map_err(TraversalError::Bind)?.port();
    let mut peer_port = peer.public_port;

    match select_strategy(own.nat_kind, peer.nat_kind)? {
        Strategy::Direct => {}
        Strategy::GuessRemotePort => {
            peer_port = guess_remote_port(peer_ip, remote_guess_config(&socket, &own)).await?;
        }
        Strategy::GuessLocalPort => {
            local_port = guess_local_port(SocketAddr::new(peer_ip, peer.public_port)).await?;
        }
    }

    // the classification socket must be gone before WireGuard binds
    // the listen port, which in the easy case is this very port
    drop(socket);

    Ok(PunchedRoute {
        local_port,
        peer_ip,
        peer_port,
    })
}

fn remote_guess_config(socket: &Arc<UdpSocket>, own: &StunInfo) -> RemoteGuessConfig {
    let public_addr = own
        .public_ip
        .parse()
        .ok()
        .map(|ip| SocketAddr::new(ip, own.public_port));
    RemoteGuessConfig {
        socket: Some(Arc::clone(socket)),
        public_addr,
        interactive: false,
    }
}

/// Program the resolved route into the WireGuard device: peer endpoint
/// first (with persistent keepalive), then the listen port.
///
/// # Errors
///
/// Surfaces any [`WgError`].
pub async fn apply_route(
    wg: &WgClient,
    peer_pubkey: &str,
    route: &PunchedRoute,
) -> Result<(), TraversalError> {
    tracing::info!(
        "configuring {}: peer {} -> {}:{}, listen port {}",
        wg.iface(),
        peer_pubkey,
        route.peer_ip,
        route.peer_port,
        route.local_port
    );

    wg.set_peer_endpoint(peer_pubkey, route.peer_ip, route.peer_port)
        .await?;
    wg.set_listen_port(route.local_port).await?;
    Ok(())
}
