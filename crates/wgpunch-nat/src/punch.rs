//! UDP hole punching
//!
//! Two port-guessing strategies built on one small wire handshake.
//! Probes carry `"UNKNOWN"` until the sender has learned the
//! counterpart's port, then `"RESOLVED"`; the source address of the
//! first datagram a socket hears is the counterpart's public address
//! from that socket's point of view, whatever the payload says.
//!
//! The easy side of an easy/hard pair runs [`guess_remote_port`] on its
//! single, already-classified socket; the hard side runs
//! [`guess_local_port`] over a fan of sockets and keeps the one whose
//! mapping the peer happened to accept.

use crate::stun::{self, StunError};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Probe payload sent before the counterpart's port is known
const UNKNOWN_PAYLOAD: &[u8] = b"UNKNOWN";
/// Payload sent once the counterpart's address has been learned
const RESOLVED_PAYLOAD: &[u8] = b"RESOLVED";

/// Rolling read deadline, so a receiver never sits in a read forever
const READ_DEADLINE: Duration = Duration::from_secs(2);

/// Packets per burst while searching random remote ports
const SEARCH_BURST: usize = 10;
/// Packets per burst in the local-port fan and after resolution
const LOCKED_BURST: usize = 5;

/// Inter-burst sleep while searching remote ports
const SEARCH_INTERVAL: Duration = Duration::from_millis(5);
/// Inter-burst sleep once the destination is locked
const LOCKED_INTERVAL: Duration = Duration::from_millis(50);
/// Inter-burst sleep for each socket in the fan
const FAN_INTERVAL: Duration = Duration::from_millis(200);

/// Sockets opened by the hard side's fan
const FAN_SIZE: usize = 384;

/// Extra `"RESOLVED"` iterations after the ack, so the peer's own state
/// machine very likely reaches its terminal state too
const POST_ACK_ITERATIONS: u32 = 10;

/// Result of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// Counterpart's public port as seen by the winning socket
    pub peer_port: u16,
    /// Local port of the socket that heard the counterpart
    pub local_port: u16,
}

/// Hole punching error
#[derive(Debug)]
pub enum PunchError {
    /// I/O error on a punching socket
    Io(std::io::Error),
    /// STUN probe run on behalf of the engine failed
    Stun(StunError),
    /// Internal channel closed before the handshake completed
    Closed,
}

impl std::fmt::Display for PunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Stun(e) => write!(f, "STUN error: {e}"),
            Self::Closed => write!(f, "punching session closed before completion"),
        }
    }
}

impl std::error::Error for PunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Stun(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for PunchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<StunError> for PunchError {
    fn from(err: StunError) -> Self {
        Self::Stun(err)
    }
}

/// One punching attempt's shared state.
///
/// The first socket in the session to hear anything claims the flag;
/// scoping it here keeps concurrent sessions in one process from
/// interfering with each other.
struct Session {
    got_first_response: AtomicBool,
}

impl Session {
    fn new() -> Self {
        Self {
            got_first_response: AtomicBool::new(false),
        }
    }

    fn heard(&self) -> bool {
        self.got_first_response.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.got_first_response
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Draw a random port in `[1024, 65536)`.
fn random_ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(1024u32..65536) as u16
}

/// Spawn the per-socket receiver loop shared by every strategy.
///
/// The session's first datagram (on any socket) publishes `PortInfo`
/// on `resolved`; a literal `"RESOLVED"` payload signals `acked`.
/// Reads carry a rolling short deadline, and the `release` signal is a
/// terminal condition; a lapsed deadline is a quiet retry.
fn spawn_receiver(
    socket: Arc<UdpSocket>,
    session: Arc<Session>,
    resolved: mpsc::Sender<PortInfo>,
    acked: mpsc::Sender<()>,
    mut release: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local_port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::error!("receiver has no local address: {e}");
                return;
            }
        };

        let mut buf = [0u8; 1024];
        loop {
            if *release.borrow() {
                break;
            }
            tokio::select! {
                changed = release.changed() => {
                    if changed.is_err() {
                        // the socket's owner is gone
                        break;
                    }
                }
                result = timeout(READ_DEADLINE, socket.recv_from(&mut buf)) => match result {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        tracing::debug!("receive error on :{local_port}: {e}");
                        continue;
                    }
                    Ok(Ok((len, from))) => {
                        tracing::debug!(
                            "{from} sent a response: {}",
                            String::from_utf8_lossy(&buf[..len])
                        );
                        if session.claim() {
                            let _ = resolved.try_send(PortInfo {
                                peer_port: from.port(),
                                local_port,
                            });
                        }
                        if &buf[..len] == RESOLVED_PAYLOAD {
                            // repeated acks coalesce into one signal
                            let _ = acked.try_send(());
                        }
                    }
                },
            }
        }
    })
}

/// Configuration for [`guess_remote_port`].
#[derive(Default)]
pub struct RemoteGuessConfig {
    /// Socket to punch from; the engine borrows it and leaves it open.
    /// Must be the socket the caller classified with, or the mapping
    /// the peer targets will not exist. A fresh socket is bound when
    /// absent (diagnostics only).
    pub socket: Option<Arc<UdpSocket>>,
    /// Already-known reflexive address of `socket`; probed via STUN
    /// when absent.
    pub public_addr: Option<SocketAddr>,
    /// Print the local/public mapping and wait for Enter before
    /// punching (used by the interactive tester).
    pub interactive: bool,
}

/// Guess a hard peer's current ephemeral port from the easy side.
///
/// Bursts `"UNKNOWN"` at uniformly random ports of `peer_ip` until the
/// peer's own fan lands a datagram here, which reveals its port; then
/// bursts `"RESOLVED"` at the revealed address until the peer confirms
/// it resolved us too, plus a few extra rounds for packet loss.
///
/// Expected worst case is ~65535/10 iterations, but in practice the
/// hard side is simultaneously spraying this socket's public port,
/// which the easy NAT accepts from any source, so convergence is fast.
///
/// There is no intrinsic wall-clock bound; callers wrap this in a
/// timeout. On return the engine has released the socket: no receiver
/// task holds a reference any more.
///
/// # Errors
///
/// Returns `PunchError` on socket I/O failure or a failed implicit
/// STUN probe.
pub async fn guess_remote_port(
    peer_ip: IpAddr,
    config: RemoteGuessConfig,
) -> Result<u16, PunchError> {
    let socket = match config.socket {
        Some(socket) => socket,
        None => Arc::new(UdpSocket::bind("0.0.0.0:0").await?),
    };

    if config.interactive {
        let public_addr = match config.public_addr {
            Some(addr) => addr,
            None => stun::query(&socket, stun::STUN_GOOGLE).await?,
        };
        println!("{} -> {}", socket.local_addr()?, public_addr);
        println!("Press Enter to continue");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
    }

    let session = Arc::new(Session::new());
    let (release_tx, release_rx) = watch::channel(false);
    let (resolved_tx, mut resolved_rx) = mpsc::channel::<PortInfo>(1);
    let (acked_tx, mut acked_rx) = mpsc::channel::<()>(1);
    let receiver = spawn_receiver(
        Arc::clone(&socket),
        Arc::clone(&session),
        resolved_tx,
        acked_tx,
        release_rx,
    );

    let mut port_info: Option<PortInfo> = None;
    let mut destination = SocketAddr::new(peer_ip, random_ephemeral_port());
    let mut payload = UNKNOWN_PAYLOAD;
    let mut interval = SEARCH_INTERVAL;
    let mut was_acked = false;
    let mut remaining = POST_ACK_ITERATIONS;

    while remaining > 0 {
        if !session.heard() {
            destination = SocketAddr::new(peer_ip, random_ephemeral_port());
            tracing::trace!("trying {destination} ...");
        } else if was_acked {
            remaining -= 1;
        }

        for _ in 0..SEARCH_BURST {
            socket.send_to(payload, destination).await?;
        }

        if let Ok(info) = resolved_rx.try_recv() {
            destination = SocketAddr::new(peer_ip, info.peer_port);
            payload = RESOLVED_PAYLOAD;
            interval = LOCKED_INTERVAL;
            port_info = Some(info);
            tracing::info!("peer resolved at {destination}");
        }

        // only look for the ack once we know the peer's address;
        // an earlier ack signal cannot exist
        if payload == RESOLVED_PAYLOAD && !was_acked && acked_rx.try_recv().is_ok() {
            was_acked = true;
        }

        sleep(interval).await;
    }

    let _ = release_tx.send(true);
    let _ = receiver.await;
    port_info.map(|info| info.peer_port).ok_or(PunchError::Closed)
}

/// One socket of the hard side's fan, with its shutdown signal and
/// receiver task.
struct FanSocket {
    socket: Arc<UdpSocket>,
    release: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

/// Guess which local port the easy peer can reach, from the hard side.
///
/// Opens a fan of 384 sockets on random local ports, each
/// spraying `"UNKNOWN"` at the peer's known public address. The hard
/// NAT maps every socket independently; by chance one of the mappings
/// matches what the peer's NAT accepts, and the first inbound datagram
/// identifies it. Every other socket is released, the survivor
/// confirms with `"RESOLVED"` until acked, and its local port is
/// returned for the VPN to listen on. The survivor is fully closed
/// before this returns so the port is immediately rebindable.
///
/// # Errors
///
/// Returns `PunchError` if the surviving socket fails or the fan dies
/// before any socket hears the peer. Individual bind failures while
/// assembling the fan are retried with a new random port.
pub async fn guess_local_port(peer: SocketAddr) -> Result<u16, PunchError> {
    let session = Arc::new(Session::new());
    let (all_done_tx, mut all_done_rx) = mpsc::channel::<PortInfo>(1);
    let (acked_tx, mut acked_rx) = mpsc::channel::<()>(1);

    let mut fan: Vec<FanSocket> = Vec::with_capacity(FAN_SIZE);
    while fan.len() < FAN_SIZE {
        let socket = match UdpSocket::bind(("0.0.0.0", random_ephemeral_port())).await {
            Ok(socket) => Arc::new(socket),
            // port already taken or otherwise unusable; draw again
            Err(_) => continue,
        };

        let (release_tx, release_rx) = watch::channel(false);
        let (resolved_tx, resolved_rx) = mpsc::channel::<PortInfo>(1);
        let receiver = spawn_receiver(
            Arc::clone(&socket),
            Arc::clone(&session),
            resolved_tx,
            acked_tx.clone(),
            release_rx.clone(),
        );
        spawn_fan_worker(
            Arc::clone(&socket),
            peer,
            resolved_rx,
            all_done_tx.clone(),
            release_rx,
        );

        fan.push(FanSocket {
            socket,
            release: release_tx,
            receiver,
        });
    }
    drop(all_done_tx);

    let info = all_done_rx.recv().await.ok_or(PunchError::Closed)?;

    // keep the socket the peer reached; release the rest of the fan
    let mut winner = None;
    for entry in fan {
        let port = entry.socket.local_addr().map(|addr| addr.port());
        if winner.is_none() && port.map_or(false, |p| p == info.local_port) {
            winner = Some(entry);
        } else {
            let _ = entry.release.send(true);
        }
    }
    let winner = winner.ok_or(PunchError::Closed)?;
    tracing::info!("local port :{} survived", info.local_port);

    loop {
        for _ in 0..LOCKED_BURST {
            winner.socket.send_to(RESOLVED_PAYLOAD, peer).await?;
        }
        if acked_rx.try_recv().is_ok() {
            break;
        }
        sleep(LOCKED_INTERVAL).await;
    }

    // release the survivor too and wait the receiver out, so the VPN
    // can take over its port right away
    let _ = winner.release.send(true);
    let _ = winner.receiver.await;
    Ok(info.local_port)
}

/// Send loop for one fan socket: burst `"UNKNOWN"` until this socket
/// resolves the peer (then report on `all_done`) or the fan is
/// released.
fn spawn_fan_worker(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut resolved_rx: mpsc::Receiver<PortInfo>,
    all_done: mpsc::Sender<PortInfo>,
    release: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::trace!("trying {:?} ...", socket.local_addr());
        loop {
            if *release.borrow() {
                break;
            }
            for _ in 0..LOCKED_BURST {
                if let Err(e) = socket.send_to(UNKNOWN_PAYLOAD, peer).await {
                    tracing::debug!("fan send error: {e}");
                    return;
                }
            }
            if let Ok(info) = resolved_rx.try_recv() {
                let _ = all_done.try_send(info);
                break;
            }
            sleep(FAN_INTERVAL).await;
        }
    })
}

/// Diagnostic punch against a caller-supplied port.
///
/// Bursts `greeting` at the peer forever, logging whatever comes back;
/// terminated only by the caller. Not part of the automated flow.
///
/// # Errors
///
/// Returns `PunchError` if a send fails.
pub async fn simple_test(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    greeting: String,
) -> Result<(), PunchError> {
    let session = Arc::new(Session::new());
    let (_release_tx, release_rx) = watch::channel(false);
    let (resolved_tx, mut resolved_rx) = mpsc::channel::<PortInfo>(1);
    let (acked_tx, _acked_rx) = mpsc::channel::<()>(1);
    spawn_receiver(
        Arc::clone(&socket),
        session,
        resolved_tx,
        acked_tx,
        release_rx,
    );

    println!("trying {peer} ...");
    loop {
        for _ in 0..LOCKED_BURST {
            socket.send_to(greeting.as_bytes(), peer).await?;
        }
        if let Ok(info) = resolved_rx.try_recv() {
            println!("peer responded from port {}", info.peer_port);
        }
        sleep(LOCKED_INTERVAL).await;
    }
}
