//! Rendezvous server
//!
//! A process-wide presence table keyed by public key, with a 20 s TTL
//! per entry, plus an optional websocket per key for waking peers that
//! are otherwise idle. All state is in memory; nothing is persisted.

use crate::proto::{WakeMessage, DEFAULT_PORT, PONG_WAIT, PRESENCE_TTL, WRITE_QUEUE_DEPTH};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};
use wgpunch_nat::StunInfo;

/// How long a fetch handler waits for confirmation that a wake-up was
/// written before giving up on the report (the wake itself is already
/// queued either way).
const WAKE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Rendezvous server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the HTTP surface
    pub bind_addr: SocketAddr,
    /// Presence entry lifetime
    pub presence_ttl: Duration,
    /// Push-client read deadline; PINGs go out every ⅔ of this
    pub pong_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            presence_ttl: PRESENCE_TTL,
            pong_wait: PONG_WAIT,
        }
    }
}

/// One published peer and the task that will expire it.
struct PresenceEntry {
    info: StunInfo,
    expiry: JoinHandle<()>,
}

/// A queued wake-up write and its one-shot status report.
struct WriteRequest {
    message: WakeMessage,
    status: oneshot::Sender<Result<(), String>>,
}

/// One registered push client.
///
/// Dropping `write_tx` is what terminates the writer task, which then
/// closes the websocket; the reader is aborted outright.
struct PushClient {
    id: u64,
    write_tx: mpsc::Sender<WriteRequest>,
    reader: JoinHandle<()>,
}

impl PushClient {
    fn close(self) {
        self.reader.abort();
        // write_tx drops here; the writer task sends a Close frame and
        // exits once the queue drains
    }
}

struct ServerState {
    presence: Mutex<HashMap<String, PresenceEntry>>,
    clients: Mutex<HashMap<String, PushClient>>,
    config: ServerConfig,
    next_client_id: AtomicU64,
}

impl ServerState {
    /// Insert or refresh a presence entry.
    ///
    /// An unchanged value leaves the timer alone so steady-state
    /// publishers do not extend their own entries forever; a changed
    /// value re-arms the timer to a full TTL.
    async fn publish(self: &Arc<Self>, pubkey: String, info: StunInfo) {
        let mut table = self.presence.lock().await;
        match table.entry(pubkey) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().info != info {
                    let expiry = self.spawn_expiry(occupied.key().clone());
                    let entry = occupied.get_mut();
                    entry.expiry.abort();
                    entry.info = info;
                    entry.expiry = expiry;
                }
            }
            Entry::Vacant(vacant) => {
                let expiry = self.spawn_expiry(vacant.key().clone());
                vacant.insert(PresenceEntry { info, expiry });
            }
        }
    }

    fn spawn_expiry(self: &Arc<Self>, pubkey: String) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let ttl = self.config.presence_ttl;
        tokio::spawn(async move {
            sleep(ttl).await;
            state.presence.lock().await.remove(&pubkey);
            tracing::debug!("deleted {pubkey} from table");
        })
    }

    async fn lookup(&self, pubkey: &str) -> Option<StunInfo> {
        self.presence
            .lock()
            .await
            .get(pubkey)
            .map(|entry| entry.info.clone())
    }

    /// Best-effort wake-up of the push client registered under `pubkey`.
    ///
    /// Queueing never blocks; a full queue drops the wake. The write
    /// result is observed only long enough to log it.
    async fn wake(&self, pubkey: &str, requester: String) {
        let (status_tx, status_rx) = oneshot::channel();
        {
            let clients = self.clients.lock().await;
            let Some(client) = clients.get(pubkey) else {
                return;
            };
            let request = WriteRequest {
                message: WakeMessage { peer: requester },
                status: status_tx,
            };
            if client.write_tx.try_send(request).is_err() {
                tracing::warn!("wake queue full for {pubkey}");
                return;
            }
        }

        match timeout(WAKE_CONFIRM_TIMEOUT, status_rx).await {
            Ok(Ok(Ok(()))) => tracing::debug!("notified peer {pubkey}"),
            Ok(Ok(Err(e))) => tracing::warn!("failed to notify peer {pubkey}: {e}"),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!("failed to notify peer {pubkey}: write not confirmed");
            }
        }
    }

    /// Attach a freshly upgraded websocket under `pubkey`, closing any
    /// prior client registered there.
    async fn register_client(self: &Arc<Self>, pubkey: String, websocket: WebSocket) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (ws_tx, ws_rx) = websocket.split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let reader = tokio::spawn(read_incoming(Arc::clone(self), pubkey.clone(), id, ws_rx));
        tokio::spawn(write_outgoing(
            Arc::clone(self),
            pubkey.clone(),
            id,
            ws_tx,
            write_rx,
        ));

        let mut clients = self.clients.lock().await;
        if let Some(prior) = clients.insert(
            pubkey.clone(),
            PushClient {
                id,
                write_tx,
                reader,
            },
        ) {
            tracing::debug!("replacing push client for {pubkey}");
            prior.close();
        }
    }

    /// Remove a push client, but only the generation that asked; a
    /// replacement registered in the meantime stays.
    async fn remove_client(&self, pubkey: &str, id: u64) {
        let mut clients = self.clients.lock().await;
        if clients.get(pubkey).map_or(false, |client| client.id == id) {
            if let Some(client) = clients.remove(pubkey) {
                client.close();
            }
        }
    }
}

/// Read half of a push client: inbound messages are only logged, but
/// their arrival (normally PONGs) is what proves liveness. Silence for
/// a whole `pong_wait` tears the client down.
async fn read_incoming(
    state: Arc<ServerState>,
    pubkey: String,
    id: u64,
    mut ws_rx: SplitStream<WebSocket>,
) {
    let pong_wait = state.config.pong_wait;
    loop {
        match timeout(pong_wait, ws_rx.next()).await {
            Err(_) => {
                tracing::debug!("peer {pubkey} missed the pong deadline");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!("socket read error: {e}");
                break;
            }
            Ok(Some(Ok(message))) => {
                if message.is_close() {
                    break;
                }
                if message.is_pong() {
                    tracing::trace!("pong from {pubkey}");
                } else if let Ok(text) = message.to_str() {
                    tracing::debug!("message from {pubkey}: {text}");
                }
            }
        }
    }
    state.remove_client(&pubkey, id).await;
}

/// Write half of a push client: the single writer for this socket.
/// Drains the wake queue, reports each write on its status channel and
/// keeps the connection alive with periodic PINGs.
async fn write_outgoing(
    state: Arc<ServerState>,
    pubkey: String,
    id: u64,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut write_rx: mpsc::Receiver<WriteRequest>,
) {
    let mut ping = interval(state.config.pong_wait * 2 / 3);
    ping.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            request = write_rx.recv() => match request {
                Some(WriteRequest { message, status }) => {
                    let result = match serde_json::to_string(&message) {
                        Ok(json) => ws_tx.send(Message::text(json)).await.map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    let failed = result.is_err();
                    let _ = status.send(result);
                    if failed {
                        break;
                    }
                }
                None => {
                    // registry dropped us (replaced or torn down)
                    let _ = ws_tx.send(Message::close()).await;
                    break;
                }
            },
            _ = ping.tick() => {
                tracing::trace!("ping {pubkey}");
                if ws_tx.send(Message::ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    state.remove_client(&pubkey, id).await;
}

/// The coordinating rendezvous server.
pub struct RendezvousServer {
    state: Arc<ServerState>,
}

impl RendezvousServer {
    /// Create a server with the given configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                presence: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                config,
                next_client_id: AtomicU64::new(0),
            }),
        }
    }

    /// The warp filter tree for the full request surface.
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        let state = Arc::clone(&self.state);
        let with_state = warp::any().map(move || Arc::clone(&state));

        let publish = warp::path::end()
            .and(warp::post())
            .and(pubkey_param())
            .and(warp::body::json())
            .and(with_state.clone())
            .and_then(handle_publish);

        let fetch = warp::path::end()
            .and(warp::get())
            .and(pubkey_param())
            .and(requester_param())
            .and(with_state.clone())
            .and_then(handle_fetch);

        let push = warp::path("ws")
            .and(warp::path::end())
            .and(pubkey_param())
            .and(warp::ws())
            .and(with_state)
            .and_then(handle_upgrade);

        publish.or(fetch).or(push).recover(handle_rejection)
    }

    /// Bind the configured address and return the bound socket address
    /// together with the serving future. Panics if the address cannot
    /// be bound, mirroring a fatal startup error.
    pub fn bind(&self) -> (SocketAddr, impl Future<Output = ()>) {
        warp::serve(self.routes()).bind_ephemeral(self.state.config.bind_addr)
    }

    /// Serve forever.
    pub async fn run(self) {
        let (addr, serving) = self.bind();
        tracing::info!("rendezvous server listening on {addr}");
        serving.await;
    }
}

#[derive(Debug)]
struct MissingPubkey;

impl warp::reject::Reject for MissingPubkey {}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    pubkey: Option<String>,
    from: Option<String>,
}

/// Extract a non-empty `pubkey` query parameter or reject with 400.
fn pubkey_param() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::query::<KeyQuery>().and_then(|query: KeyQuery| async move {
        query
            .pubkey
            .filter(|key| !key.is_empty())
            .ok_or_else(|| warp::reject::custom(MissingPubkey))
    })
}

/// Extract the optional `from` parameter identifying the requester.
fn requester_param() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::query::<KeyQuery>().map(|query: KeyQuery| query.from)
}

async fn handle_publish(
    pubkey: String,
    info: StunInfo,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    tracing::debug!("POST request with pubkey = {pubkey}");
    state.publish(pubkey, info).await;
    Ok(StatusCode::OK)
}

async fn handle_fetch(
    pubkey: String,
    requester: Option<String>,
    state: Arc<ServerState>,
) -> Result<warp::reply::Response, Rejection> {
    tracing::debug!("GET request with pubkey = {pubkey}");

    if let Some(info) = state.lookup(&pubkey).await {
        return Ok(warp::reply::json(&info).into_response());
    }

    state.wake(&pubkey, requester.unwrap_or_default()).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_upgrade(
    pubkey: String,
    ws: Ws,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    Ok(ws.on_upgrade(move |websocket| async move {
        state.register_client(pubkey, websocket).await;
    }))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code = if err.find::<MissingPubkey>().is_some() {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        tracing::warn!("unhandled rejection: {err:?}");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let reason = code.canonical_reason().unwrap_or("error");
    Ok(warp::reply::with_status(reason.to_string(), code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpunch_nat::NatKind;

    fn test_config(ttl: Duration) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().expect("loopback address"),
            presence_ttl: ttl,
            pong_wait: Duration::from_secs(1),
        }
    }

    fn sample_info(port: u16) -> StunInfo {
        StunInfo {
            public_ip: "192.0.2.1".to_string(),
            public_port: port,
            nat_kind: NatKind::Easy,
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.presence_ttl, Duration::from_secs(20));
        assert_eq!(config.pong_wait, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_publish_then_lookup() {
        let server = RendezvousServer::new(test_config(Duration::from_secs(5)));
        let info = sample_info(40000);

        server.state.publish("k".to_string(), info.clone()).await;
        assert_eq!(server.state.lookup("k").await, Some(info));
        assert_eq!(server.state.lookup("other").await, None);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let server = RendezvousServer::new(test_config(Duration::from_millis(200)));
        server.state.publish("k".to_string(), sample_info(1)).await;

        assert!(server.state.lookup("k").await.is_some());
        sleep(Duration::from_millis(400)).await;
        assert!(server.state.lookup("k").await.is_none());
    }

    #[tokio::test]
    async fn test_changed_value_resets_ttl() {
        let server = RendezvousServer::new(test_config(Duration::from_millis(400)));
        server.state.publish("k".to_string(), sample_info(1)).await;

        sleep(Duration::from_millis(250)).await;
        server.state.publish("k".to_string(), sample_info(2)).await;

        // without the reset the original timer would have fired by now
        sleep(Duration::from_millis(300)).await;
        assert_eq!(server.state.lookup("k").await, Some(sample_info(2)));

        sleep(Duration::from_millis(300)).await;
        assert!(server.state.lookup("k").await.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_value_does_not_reset_ttl() {
        let server = RendezvousServer::new(test_config(Duration::from_millis(400)));
        server.state.publish("k".to_string(), sample_info(1)).await;

        sleep(Duration::from_millis(250)).await;
        server.state.publish("k".to_string(), sample_info(1)).await;

        // the republish must not have extended the original deadline
        sleep(Duration::from_millis(300)).await;
        assert!(server.state.lookup("k").await.is_none());
    }

    #[tokio::test]
    async fn test_wake_without_client_returns_promptly() {
        let server = RendezvousServer::new(test_config(Duration::from_secs(5)));
        timeout(
            Duration::from_millis(100),
            server.state.wake("absent", String::new()),
        )
        .await
        .expect("wake on an empty registry must not block");
    }
}
