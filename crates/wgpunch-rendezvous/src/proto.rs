//! Rendezvous wire protocol.
//!
//! The request surface is deliberately tiny: `StunInfo` JSON bodies
//! addressed by a `pubkey` query parameter, plus one push message type
//! on the websocket channel.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default rendezvous server port.
pub const DEFAULT_PORT: u16 = 8080;

/// How long a published entry lives without a refreshing change.
pub const PRESENCE_TTL: Duration = Duration::from_secs(20);

/// How long the server waits for any traffic (normally a PONG) before
/// tearing a push client down. PINGs go out every ⅔ of this.
pub const PONG_WAIT: Duration = Duration::from_secs(30);

/// Bound on the per-client outbound write queue.
pub const WRITE_QUEUE_DEPTH: usize = 4096;

/// Interval between `fetch` attempts while waiting for a peer.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Wake-up pushed to a quiescent daemon when somebody asks for it.
///
/// `peer` is the asking side's public key, so the awoken peer knows
/// which counterpart to resolve; empty when the server could not
/// attribute the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeMessage {
    /// Public key of the peer that triggered the wake-up
    #[serde(default)]
    pub peer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_message_roundtrip() {
        let msg = WakeMessage {
            peer: "AbCd+/=".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"peer":"AbCd+/="}"#);
        assert_eq!(serde_json::from_str::<WakeMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_wake_message_tolerates_empty_body() {
        // older servers pushed an empty object
        let msg: WakeMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(msg.peer, "");
    }

    #[test]
    fn test_ping_runs_ahead_of_pong_deadline() {
        assert!(PONG_WAIT * 2 / 3 < PONG_WAIT);
    }
}
