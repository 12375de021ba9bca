//! STUN client (RFC 5389)
//!
//! A deliberately small subset of the protocol: Binding Requests with a
//! random transaction ID, and XOR-MAPPED-ADDRESS extraction from the
//! Success Response. Nothing else on the wire is consumed.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};

/// Default primary reflector.
pub const STUN_GOOGLE: &str = "stun.l.google.com:19302";
/// Default secondary reflector (independent operator).
pub const STUN_VOIPGATE: &str = "stun.voipgate.com:3478";

/// STUN magic cookie (RFC 5389 Section 6)
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size
const HEADER_SIZE: usize = 20;

/// Binding Request message type (method 0x001, class request)
const BINDING_REQUEST: u16 = 0x0001;
/// Binding Success Response message type
const BINDING_SUCCESS: u16 = 0x0101;
/// Binding Error Response message type
const BINDING_ERROR: u16 = 0x0111;

/// XOR-MAPPED-ADDRESS attribute type
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Address family codes inside XOR-MAPPED-ADDRESS
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// How long a single probe waits for its reflector
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// STUN error types
#[derive(Debug)]
pub enum StunError {
    /// I/O error
    Io(std::io::Error),
    /// Reflector name did not resolve to a usable address
    Dns(String),
    /// Reflector did not answer within the probe timeout
    Timeout,
    /// Packet shorter than the STUN header
    MessageTooShort,
    /// Magic cookie mismatch (not a STUN packet)
    InvalidMagicCookie,
    /// Unexpected message type
    InvalidMessageType,
    /// Malformed attribute
    InvalidAttribute,
    /// Response to a different transaction
    TransactionMismatch,
    /// Reflector answered with a Binding Error Response
    ErrorResponse,
    /// Success response without XOR-MAPPED-ADDRESS
    MissingAttribute,
    /// Two reflectors reported different public IPs
    MismatchedIp {
        /// IP reported by the first probe
        first: IpAddr,
        /// IP reported by the second probe
        second: IpAddr,
    },
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Dns(host) => write!(f, "cannot resolve STUN server {host}"),
            Self::Timeout => write!(f, "STUN query timeout"),
            Self::MessageTooShort => write!(f, "STUN message too short"),
            Self::InvalidMagicCookie => write!(f, "invalid STUN magic cookie"),
            Self::InvalidMessageType => write!(f, "invalid STUN message type"),
            Self::InvalidAttribute => write!(f, "invalid STUN attribute"),
            Self::TransactionMismatch => write!(f, "transaction ID mismatch"),
            Self::ErrorResponse => write!(f, "STUN error response"),
            Self::MissingAttribute => write!(f, "missing XOR-MAPPED-ADDRESS attribute"),
            Self::MismatchedIp { first, second } => {
                write!(f, "reflectors disagree on public IP: {first} vs {second}")
            }
        }
    }
}

impl std::error::Error for StunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StunError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Encode a Binding Request with the given transaction ID.
///
/// The request carries no attributes, so it is exactly one header.
fn encode_binding_request(transaction_id: &[u8; 12]) -> [u8; HEADER_SIZE] {
    let mut packet = [0u8; HEADER_SIZE];
    packet[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // message length stays zero: no attributes
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..20].copy_from_slice(transaction_id);
    packet
}

/// Decode an XOR-MAPPED-ADDRESS attribute value.
fn decode_xor_mapped(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::InvalidAttribute);
    }

    let family = value[1];
    let xor_port = u16::from_be_bytes([value[2], value[3]]);
    let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        FAMILY_IPV4 => {
            let magic = MAGIC_COOKIE.to_be_bytes();
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ magic[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::InvalidAttribute);
            }
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Parse a Binding Response and extract the reflexive address.
///
/// Packets that fail the magic-cookie or transaction-ID check yield
/// `InvalidMagicCookie`/`TransactionMismatch` so the caller can keep
/// listening instead of treating stray traffic as a reflector answer.
fn parse_binding_response(
    packet: &[u8],
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, StunError> {
    if packet.len() < HEADER_SIZE {
        return Err(StunError::MessageTooShort);
    }

    let cookie = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::InvalidMagicCookie);
    }
    if &packet[8..20] != transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    let msg_type = u16::from_be_bytes([packet[0], packet[1]]);
    match msg_type {
        BINDING_SUCCESS => {}
        BINDING_ERROR => return Err(StunError::ErrorResponse),
        _ => return Err(StunError::InvalidMessageType),
    }

    let msg_length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let end = packet.len().min(HEADER_SIZE + msg_length);
    let mut offset = HEADER_SIZE;

    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
        let attr_length = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_length > end {
            break;
        }

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return decode_xor_mapped(&packet[offset..offset + attr_length], transaction_id);
        }

        // skip value plus padding to the 4-byte boundary
        offset += attr_length + ((4 - (attr_length % 4)) % 4);
    }

    Err(StunError::MissingAttribute)
}

/// Resolve a reflector host:port, preferring IPv4.
async fn resolve_reflector(server: &str) -> Result<SocketAddr, StunError> {
    let addrs: Vec<SocketAddr> = lookup_host(server)
        .await
        .map_err(|_| StunError::Dns(server.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| StunError::Dns(server.to_string()))
}

/// Query a reflector for this socket's reflexive address.
///
/// The socket is borrowed, not owned: no persistent read deadline is
/// installed and the socket stays open whatever the outcome. Datagrams
/// from other sources, or STUN packets belonging to another
/// transaction, are skipped while waiting.
///
/// # Errors
///
/// Returns `StunError` if the reflector cannot be resolved or reached,
/// does not answer within the probe timeout, or answers without a
/// usable XOR-MAPPED-ADDRESS.
pub async fn query(socket: &UdpSocket, server: &str) -> Result<SocketAddr, StunError> {
    let reflector = resolve_reflector(server).await?;

    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let request = encode_binding_request(&transaction_id);
    socket.send_to(&request, reflector).await?;

    let response = async {
        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != reflector {
                tracing::trace!("ignoring datagram from {from} while probing {reflector}");
                continue;
            }
            match parse_binding_response(&buf[..len], &transaction_id) {
                Ok(addr) => return Ok(addr),
                Err(StunError::InvalidMagicCookie | StunError::TransactionMismatch) => continue,
                Err(e) => return Err(e),
            }
        }
    };

    tokio::time::timeout(QUERY_TIMEOUT, response)
        .await
        .map_err(|_| StunError::Timeout)?
}

/// Query a reflector from a fresh ephemeral socket.
///
/// Only useful for diagnostics: the mapping reported here belongs to a
/// socket that is closed on return, so it cannot be punched through.
///
/// # Errors
///
/// Same failure modes as [`query`], plus socket binding.
pub async fn query_ephemeral(server: &str) -> Result<SocketAddr, StunError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    query(&socket, server).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::binding_success;

    #[test]
    fn test_binding_request_layout() {
        let transaction_id = [7u8; 12];
        let packet = encode_binding_request(&transaction_id);

        assert_eq!(u16::from_be_bytes([packet[0], packet[1]]), BINDING_REQUEST);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
        assert_eq!(
            u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            MAGIC_COOKIE
        );
        assert_eq!(&packet[8..20], &transaction_id);
    }

    #[test]
    fn test_parse_success_response_ipv4() {
        let transaction_id = [3u8; 12];
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let packet = binding_success(&transaction_id, addr);

        let parsed = parse_binding_response(&packet, &transaction_id).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_parse_rejects_foreign_transaction() {
        let transaction_id = [3u8; 12];
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let packet = binding_success(&transaction_id, addr);

        let other_id = [4u8; 12];
        assert!(matches!(
            parse_binding_response(&packet, &other_id),
            Err(StunError::TransactionMismatch)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_cookie() {
        let transaction_id = [3u8; 12];
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let mut packet = binding_success(&transaction_id, addr);
        packet[4] ^= 0xFF;

        assert!(matches!(
            parse_binding_response(&packet, &transaction_id),
            Err(StunError::InvalidMagicCookie)
        ));
    }

    #[test]
    fn test_parse_short_message() {
        assert!(matches!(
            parse_binding_response(&[0u8; 8], &[0u8; 12]),
            Err(StunError::MessageTooShort)
        ));
    }

    #[test]
    fn test_parse_error_response() {
        let transaction_id = [9u8; 12];
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let mut packet = binding_success(&transaction_id, addr);
        packet[0..2].copy_from_slice(&BINDING_ERROR.to_be_bytes());

        assert!(matches!(
            parse_binding_response(&packet, &transaction_id),
            Err(StunError::ErrorResponse)
        ));
    }

    #[test]
    fn test_parse_missing_attribute() {
        let transaction_id = [5u8; 12];
        let mut packet = vec![0u8; HEADER_SIZE];
        packet[0..2].copy_from_slice(&BINDING_SUCCESS.to_be_bytes());
        packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet[8..20].copy_from_slice(&transaction_id);

        assert!(matches!(
            parse_binding_response(&packet, &transaction_id),
            Err(StunError::MissingAttribute)
        ));
    }

    #[test]
    fn test_xor_mapped_roundtrip_ipv6() {
        let transaction_id = [0xAB; 12];
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let packet = binding_success(&transaction_id, addr);

        let parsed = parse_binding_response(&packet, &transaction_id).unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn test_query_against_mock_reflector() {
        let reflector = crate::testutil::spawn_reflector(|src| src).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mapped = query(&socket, &reflector.to_string()).await.unwrap();
        assert_eq!(mapped, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_query_ephemeral_uses_a_throwaway_socket() {
        let reflector = crate::testutil::spawn_reflector(|src| src).await;
        let mapped = query_ephemeral(&reflector.to_string()).await.unwrap();
        assert_eq!(mapped.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_ne!(mapped.port(), 0);
    }

    #[tokio::test]
    async fn test_query_timeout_leaves_socket_usable() {
        // a bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = query(&socket, &silent_addr.to_string()).await.unwrap_err();
        assert!(matches!(err, StunError::Timeout));

        // the caller's socket survives the failed probe
        let reflector = crate::testutil::spawn_reflector(|src| src).await;
        let mapped = query(&socket, &reflector.to_string()).await.unwrap();
        assert_eq!(mapped, socket.local_addr().unwrap());
    }
}
