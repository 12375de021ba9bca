//! NAT classification
//!
//! Probes two independent reflectors from the same socket and collapses
//! the observed mapping behavior to two classes. A port-preserving
//! mapping across different destinations is taken as evidence of
//! endpoint-independent mapping; distinguishing the finer RFC variants
//! would not change which punching strategy applies.

use crate::stun::{self, StunError};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

/// NAT class as seen by the punching strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    /// Endpoint-independent mapping; one public `ip:port` for all peers
    Easy,
    /// Destination-dependent mapping; the public port changes per peer
    Hard,
}

impl std::fmt::Display for NatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// The unit of rendezvous information: one peer's view of itself.
///
/// `public_port` is authoritative only when `nat_kind` is
/// [`NatKind::Easy`]; a hard NAT's port is a last-observed hint that
/// will not match what the peer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StunInfo {
    /// Textual IPv4 literal of the reflexive address
    pub public_ip: String,
    /// Reflexive port from the first probe
    pub public_port: u16,
    /// NAT class inferred from the two probes
    pub nat_kind: NatKind,
}

impl std::fmt::Display for StunInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.nat_kind {
            NatKind::Easy => write!(f, "{}:{} ({})", self.public_ip, self.public_port, self.nat_kind),
            NatKind::Hard => write!(f, "{}:? ({})", self.public_ip, self.nat_kind),
        }
    }
}

/// Classify the NAT in front of `socket`.
///
/// Both probes run over the caller's socket so the reported mapping is
/// the one a peer will later target; probing from a throwaway socket
/// would report a mapping the punching phase cannot reach.
///
/// # Errors
///
/// Fails with `StunError` if either probe fails or times out, or with
/// `StunError::MismatchedIp` if the reflectors disagree on the public
/// IP, in which case the caller must not publish the result.
pub async fn classify(
    socket: &UdpSocket,
    reflector_a: &str,
    reflector_b: &str,
) -> Result<StunInfo, StunError> {
    let first = stun::query(socket, reflector_a).await?;
    let second = stun::query(socket, reflector_b).await?;

    if first.ip() != second.ip() {
        return Err(StunError::MismatchedIp {
            first: first.ip(),
            second: second.ip(),
        });
    }

    let nat_kind = if first.port() == second.port() {
        NatKind::Easy
    } else {
        NatKind::Hard
    };

    tracing::debug!(
        "classified as {nat_kind}: {} vs {}",
        first.port(),
        second.port()
    );

    Ok(StunInfo {
        public_ip: second.ip().to_string(),
        public_port: first.port(),
        nat_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_reflector;
    use std::net::SocketAddr;

    #[test]
    fn test_stun_info_json_roundtrip() {
        let info = StunInfo {
            public_ip: "198.51.100.4".to_string(),
            public_port: 40000,
            nat_kind: NatKind::Easy,
        };

        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"public_ip":"198.51.100.4","public_port":40000,"nat_kind":"easy"}"#
        );

        let decoded: StunInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_nat_kind_wire_names() {
        assert_eq!(serde_json::to_string(&NatKind::Easy).unwrap(), r#""easy""#);
        assert_eq!(serde_json::to_string(&NatKind::Hard).unwrap(), r#""hard""#);
        assert!(serde_json::from_str::<NatKind>(r#""symmetric""#).is_err());
    }

    #[tokio::test]
    async fn test_classify_easy_when_ports_agree() {
        let a = spawn_reflector(|src| src).await;
        let b = spawn_reflector(|src| src).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let info = classify(&socket, &a.to_string(), &b.to_string())
            .await
            .unwrap();
        assert_eq!(info.nat_kind, NatKind::Easy);
        assert_eq!(info.public_port, socket.local_addr().unwrap().port());
        assert_eq!(info.public_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_classify_hard_when_ports_differ() {
        let a = spawn_reflector(|src| src).await;
        // second reflector reports a shifted port, like a
        // destination-dependent mapping would produce
        let b = spawn_reflector(|src| SocketAddr::new(src.ip(), src.port().wrapping_add(1))).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let info = classify(&socket, &a.to_string(), &b.to_string())
            .await
            .unwrap();
        assert_eq!(info.nat_kind, NatKind::Hard);
        // the first probe's port is kept as a hint
        assert_eq!(info.public_port, socket.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_classify_rejects_mismatched_ips() {
        let a = spawn_reflector(|src| src).await;
        let b = spawn_reflector(|src| SocketAddr::new("127.0.0.2".parse().unwrap(), src.port())).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let err = classify(&socket, &a.to_string(), &b.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StunError::MismatchedIp { .. }));
    }

    #[tokio::test]
    async fn test_classify_is_idempotent() {
        let a = spawn_reflector(|src| src).await;
        let b = spawn_reflector(|src| src).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let first = classify(&socket, &a.to_string(), &b.to_string())
            .await
            .unwrap();
        let second = classify(&socket, &a.to_string(), &b.to_string())
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
