//! Rendezvous client
//!
//! Publishes this peer's `StunInfo` under its public key and retrieves
//! the counterpart's, either by polling or by holding a websocket open
//! and waiting to be woken.

use crate::proto::{WakeMessage, DEFAULT_PORT, POLL_INTERVAL};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use wgpunch_nat::StunInfo;

/// Rendezvous exchange errors
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// HTTP transport failure or undecodable body
    #[error("rendezvous transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered outside the 2xx range
    #[error("unexpected rendezvous status: {0}")]
    Status(reqwest::StatusCode),

    /// Websocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed wake-up message
    #[error("malformed wake message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Server host does not form a valid URL
    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    /// Push channel ended
    #[error("server closed the push channel")]
    Closed,
}

/// HTTP client for one rendezvous server.
pub struct RendezvousClient {
    authority: String,
    http: reqwest::Client,
}

impl RendezvousClient {
    /// Create a client for `server_host`, which may carry an explicit
    /// port; the default rendezvous port is appended otherwise.
    #[must_use]
    pub fn new(server_host: &str) -> Self {
        let authority = if server_host.contains(':') {
            server_host.to_string()
        } else {
            format!("{server_host}:{DEFAULT_PORT}")
        };
        Self {
            authority,
            http: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}/", self.authority)
    }

    /// Publish this peer's info under its public key.
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError` on transport failure or a non-2xx
    /// response.
    pub async fn publish(&self, pubkey: &str, info: &StunInfo) -> Result<(), RendezvousError> {
        let response = self
            .http
            .post(self.base_url())
            .query(&[("pubkey", pubkey)])
            .json(info)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RendezvousError::Status(response.status()));
        }
        Ok(())
    }

    /// Fetch a peer's info; `None` means "not yet published".
    ///
    /// `requester` identifies this peer so the server can tell a
    /// quiescent counterpart who is looking for it.
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError` on transport failure, a non-2xx
    /// non-204 response, or an undecodable body.
    pub async fn fetch(
        &self,
        peer_pubkey: &str,
        requester: Option<&str>,
    ) -> Result<Option<StunInfo>, RendezvousError> {
        let mut request = self
            .http
            .get(self.base_url())
            .query(&[("pubkey", peer_pubkey)]);
        if let Some(from) = requester {
            request = request.query(&[("from", from)]);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RendezvousError::Status(response.status()));
        }
        Ok(Some(response.json().await?))
    }

    /// Poll [`fetch`](Self::fetch) until the peer shows up.
    ///
    /// Polls every 300 ms with no intrinsic bound; callers impose the
    /// overall timeout and may cancel between polls.
    ///
    /// # Errors
    ///
    /// Surfaces any `fetch` error at the next poll.
    pub async fn wait_for(
        &self,
        peer_pubkey: &str,
        requester: Option<&str>,
    ) -> Result<StunInfo, RendezvousError> {
        loop {
            if let Some(info) = self.fetch(peer_pubkey, requester).await? {
                return Ok(info);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Open the push channel under this peer's own public key.
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError` if the URL cannot be formed or the
    /// websocket handshake fails.
    pub async fn subscribe(&self, own_pubkey: &str) -> Result<WakeStream, RendezvousError> {
        let mut url = Url::parse(&format!("ws://{}/ws", self.authority))?;
        url.query_pairs_mut().append_pair("pubkey", own_pubkey);

        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(WakeStream { stream })
    }
}

/// Server-push channel yielding wake-up messages.
///
/// Answers the server's PING frames with PONGs while waiting, which is
/// what keeps the registration alive.
pub struct WakeStream {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WakeStream {
    /// Wait for the next wake-up.
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError::Closed` when the server ends the
    /// channel, or a transport/decode error.
    pub async fn next_wake(&mut self) -> Result<WakeMessage, RendezvousError> {
        loop {
            let message = self
                .stream
                .next()
                .await
                .ok_or(RendezvousError::Closed)??;

            match message {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Ping(payload) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Close(_) => return Err(RendezvousError::Closed),
                _ => {}
            }
        }
    }
}
