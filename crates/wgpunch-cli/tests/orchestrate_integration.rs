//! Whole-attempt orchestration flows over loopback: a pair of mock
//! reflectors standing in for the public STUN servers, plus a real
//! rendezvous server.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use wgpunch_cli::{resolve_route_with, ResolveConfig, TraversalError};
use wgpunch_rendezvous::{RendezvousClient, RendezvousServer, ServerConfig};

const KEY_A: &str = "oDhLEBAsJmbFVNVFMQUR0M1k1+Wh6Pu74Ct0BJ3VLTA=";
const KEY_B: &str = "wCq7nlDTmZSk0HXZhFvJXwAY0Uj0c1hZ8t4V5K7rCGk=";

const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Minimal Binding Success Response builder (IPv4 only).
fn binding_success(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
    let IpAddr::V4(ip) = addr.ip() else {
        panic!("reflector mock only speaks IPv4");
    };

    let mut value = vec![0u8, 0x01];
    value.extend_from_slice(&(addr.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    let magic = MAGIC_COOKIE.to_be_bytes();
    for (i, octet) in ip.octets().iter().enumerate() {
        value.push(octet ^ magic[i]);
    }

    let mut packet = Vec::with_capacity(32);
    packet.extend_from_slice(&0x0101u16.to_be_bytes());
    packet.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet.extend_from_slice(&0x0020u16.to_be_bytes());
    packet.extend_from_slice(&(value.len() as u16).to_be_bytes());
    packet.extend_from_slice(&value);
    packet
}

/// Reflector reporting the observed source port shifted by `shift`;
/// a zero shift mimics an easy NAT, a nonzero one a hard NAT's second
/// probe.
async fn spawn_reflector(shift: u16) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            if len < 20 {
                continue;
            }
            let mut transaction_id = [0u8; 12];
            transaction_id.copy_from_slice(&buf[8..20]);
            let reported = SocketAddr::new(src.ip(), src.port().wrapping_add(shift));
            let _ = socket
                .send_to(&binding_success(&transaction_id, reported), src)
                .await;
        }
    });

    addr
}

async fn start_rendezvous() -> SocketAddr {
    let server = RendezvousServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    });
    let (addr, serving) = server.bind();
    tokio::spawn(serving);
    addr
}

#[tokio::test]
async fn test_easy_peers_exchange_direct_routes() {
    let rendezvous_addr = start_rendezvous().await;
    let reflector_a = spawn_reflector(0).await;
    let reflector_b = spawn_reflector(0).await;

    let config = ResolveConfig {
        reflector_a: reflector_a.to_string(),
        reflector_b: reflector_b.to_string(),
    };

    let client_a = RendezvousClient::new(&rendezvous_addr.to_string());
    let client_b = RendezvousClient::new(&rendezvous_addr.to_string());

    let (route_a, route_b) = timeout(
        Duration::from_secs(10),
        async {
            tokio::join!(
                resolve_route_with(&client_a, KEY_A, KEY_B, &config),
                resolve_route_with(&client_b, KEY_B, KEY_A, &config),
            )
        },
    )
    .await
    .expect("easy/easy resolution should not block");

    let route_a = route_a.unwrap();
    let route_b = route_b.unwrap();

    // no punching ran: each side simply learned the other's socket
    assert_eq!(route_a.peer_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(route_b.peer_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(route_a.peer_port, route_b.local_port);
    assert_eq!(route_b.peer_port, route_a.local_port);
}

#[tokio::test]
async fn test_hard_pair_is_rejected_without_punching() {
    let rendezvous_addr = start_rendezvous().await;
    let reflector_a = spawn_reflector(0).await;
    // the second probe sees a different port: a hard NAT
    let reflector_b = spawn_reflector(1).await;

    let config = ResolveConfig {
        reflector_a: reflector_a.to_string(),
        reflector_b: reflector_b.to_string(),
    };

    let client_a = RendezvousClient::new(&rendezvous_addr.to_string());
    let client_b = RendezvousClient::new(&rendezvous_addr.to_string());

    let (result_a, result_b) = timeout(
        Duration::from_secs(10),
        async {
            tokio::join!(
                resolve_route_with(&client_a, KEY_A, KEY_B, &config),
                resolve_route_with(&client_b, KEY_B, KEY_A, &config),
            )
        },
    )
    .await
    .expect("hard/hard detection should not block");

    assert!(matches!(result_a, Err(TraversalError::BothHardNat)));
    assert!(matches!(result_b, Err(TraversalError::BothHardNat)));
}
