//! # wgpunch WireGuard interface
//!
//! The few control-plane operations the orchestrator needs from the
//! local WireGuard device: read its public key, list its peers, point a
//! peer at a new endpoint and move the listen port. Backed by the
//! `wg(8)` utility; the VPN data plane itself is out of scope.

use std::net::{IpAddr, SocketAddr};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;

/// Keepalive written alongside every endpoint update, so the punched
/// pinhole outlives idle periods.
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// WireGuard control-plane errors
#[derive(Debug, Error)]
pub enum WgError {
    /// `wg` could not be spawned
    #[error("failed to run wg: {0}")]
    Io(#[from] std::io::Error),

    /// `wg` exited non-zero
    #[error("wg {args} failed: {stderr}")]
    Command {
        /// Arguments passed to `wg`
        args: String,
        /// Captured stderr, trimmed
        stderr: String,
    },

    /// `wg` output did not have the expected shape
    #[error("unexpected wg output: {0}")]
    Parse(String),
}

/// One configured peer as reported by `wg show <iface> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    /// Peer public key (base64)
    pub public_key: String,
    /// Last known endpoint, if any
    pub endpoint: Option<SocketAddr>,
}

/// Handle to one WireGuard interface.
pub struct WgClient {
    iface: String,
}

impl WgClient {
    /// Create a handle for `iface`; no validation happens until the
    /// first command runs.
    #[must_use]
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
        }
    }

    /// The interface this handle drives.
    #[must_use]
    pub fn iface(&self) -> &str {
        &self.iface
    }

    async fn wg(&self, args: &[&str]) -> Result<String, WgError> {
        let output: Output = Command::new("wg").args(args).output().await?;
        if !output.status.success() {
            return Err(WgError::Command {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// The device's own public key.
    ///
    /// # Errors
    ///
    /// Returns `WgError` if `wg` fails, typically because the interface
    /// does not exist or the caller lacks privileges.
    pub async fn device_public_key(&self) -> Result<String, WgError> {
        let out = self.wg(&["show", &self.iface, "public-key"]).await?;
        let key = out.trim();
        if key.is_empty() {
            return Err(WgError::Parse("empty public key".to_string()));
        }
        Ok(key.to_string())
    }

    /// All configured peers with their last known endpoints.
    ///
    /// # Errors
    ///
    /// Returns `WgError` if `wg` fails or its dump output is malformed.
    pub async fn peers(&self) -> Result<Vec<WgPeer>, WgError> {
        let out = self.wg(&["show", &self.iface, "dump"]).await?;
        parse_dump(&out)
    }

    /// Point `peer` at `ip:port` with a persistent keepalive.
    ///
    /// # Errors
    ///
    /// Returns `WgError` if the device rejects the configuration.
    pub async fn set_peer_endpoint(
        &self,
        peer: &str,
        ip: IpAddr,
        port: u16,
    ) -> Result<(), WgError> {
        let endpoint = SocketAddr::new(ip, port).to_string();
        let keepalive = PERSISTENT_KEEPALIVE_SECS.to_string();
        tracing::info!("setting {peer} endpoint to {endpoint}");
        self.wg(&[
            "set",
            &self.iface,
            "peer",
            peer,
            "endpoint",
            &endpoint,
            "persistent-keepalive",
            &keepalive,
        ])
        .await?;
        Ok(())
    }

    /// Move the device's UDP listen port.
    ///
    /// # Errors
    ///
    /// Returns `WgError` if the device rejects the port.
    pub async fn set_listen_port(&self, port: u16) -> Result<(), WgError> {
        tracing::info!("setting {} listen port to {port}", self.iface);
        self.wg(&["set", &self.iface, "listen-port", &port.to_string()])
            .await?;
        Ok(())
    }
}

/// Parse `wg show <iface> dump` output.
///
/// The first line describes the device; each further line is one peer:
/// `pubkey psk endpoint allowed-ips handshake rx tx keepalive`, with
/// `(none)` standing in for an absent endpoint.
fn parse_dump(dump: &str) -> Result<Vec<WgPeer>, WgError> {
    let mut peers = Vec::new();

    for line in dump.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return Err(WgError::Parse(format!("short peer line: {line:?}")));
        }
        let endpoint = match fields[2] {
            "(none)" => None,
            addr => Some(
                addr.parse()
                    .map_err(|_| WgError::Parse(format!("bad endpoint {addr:?}")))?,
            ),
        };
        peers.push(WgPeer {
            public_key: fields[0].to_string(),
            endpoint,
        });
    }

    Ok(peers)
}
