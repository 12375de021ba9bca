//! Shared helpers for exercising the STUN path against loopback mocks.

use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Build a Binding Success Response carrying `addr` as XOR-MAPPED-ADDRESS.
pub fn binding_success(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
    let mut value = vec![0u8];
    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&xor_port.to_be_bytes());
            let magic = MAGIC_COOKIE.to_be_bytes();
            for (i, octet) in ip.octets().iter().enumerate() {
                value.push(octet ^ magic[i]);
            }
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&xor_port.to_be_bytes());
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key[4..].copy_from_slice(transaction_id);
            for (i, octet) in ip.octets().iter().enumerate() {
                value.push(octet ^ key[i]);
            }
        }
    }

    let mut packet = Vec::with_capacity(20 + 4 + value.len());
    packet.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    packet.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    packet.extend_from_slice(&(value.len() as u16).to_be_bytes());
    packet.extend_from_slice(&value);
    packet
}

/// Spawn a loopback reflector answering every Binding Request.
///
/// `map` turns the observed source address into the address reported
/// back, which lets tests fake port-preserving and port-randomizing
/// NATs from the same helper.
pub async fn spawn_reflector(
    map: impl Fn(SocketAddr) -> SocketAddr + Send + 'static,
) -> SocketAddr {
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
            let response = binding_success(&transaction_id, map(src));
            let _ = socket.send_to(&response, src).await;
        }
    });

    addr
}
