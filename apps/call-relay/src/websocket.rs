use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::calls::CallSessionStore;
use crate::handlers::SharedState;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::router::{Outbound, SignalingRouter};

const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Per-connection flow control and liveness settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Messages queued for one socket before further deliveries fail.
    pub outbox_capacity: usize,
    /// How often the relay pings each client.
    pub ping_interval: Duration,
    /// A connection that sends nothing (pongs included) for this long is
    /// treated as gone.
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Outboxes of every open WebSocket, keyed by connection handle.
#[derive(Clone)]
pub struct ConnectionTable {
    outboxes: Arc<DashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    capacity: usize,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            outboxes: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Mint a handle for a new connection and return the receiving end of
    /// its outbox.
    pub fn open(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let connection = ConnectionId::new();
        self.outboxes.insert(connection, tx);
        (connection, rx)
    }

    pub fn close(&self, connection: ConnectionId) {
        self.outboxes.remove(&connection);
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbound for ConnectionTable {
    /// A full outbox counts as a failed delivery; the client is not keeping up.
    fn deliver(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        let Some(tx) = self.outboxes.get(&connection) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                counter!("call_relay_outbox_drops_total", 1, "kind" => message.kind());
                warn!(
                    connection_id = %connection,
                    kind = message.kind(),
                    "outbox full; dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Transport-side state: the router plus the sockets it delivers to.
#[derive(Clone)]
pub struct SignalingState {
    pub router: SignalingRouter,
    pub connections: ConnectionTable,
    pub transport: TransportConfig,
}

impl SignalingState {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(transport: TransportConfig) -> Self {
        let connections = ConnectionTable::with_capacity(transport.outbox_capacity);
        let router = SignalingRouter::new(
            ConnectionRegistry::new(),
            CallSessionStore::new(),
            Arc::new(connections.clone()),
        );
        Self {
            router,
            connections,
            transport,
        }
    }

    /// Periodically drop calls that have been ringing longer than
    /// `ring_timeout`.
    pub fn spawn_sweeper(&self, ring_timeout: Duration, every: Duration) -> JoinHandle<()> {
        let router = self.router.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            loop {
                interval.tick().await;
                let expired = router.expire_stale(Instant::now(), ring_timeout);
                if expired > 0 {
                    debug!(expired, "expired stale ringing calls");
                }
            }
        })
    }
}

impl Default for SignalingState {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> Response {
    let signaling = state.signaling.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, signaling, remote_addr))
}

async fn handle_socket(socket: WebSocket, signaling: SignalingState, remote_addr: SocketAddr) {
    let (connection_id, mut outbox) = signaling.connections.open();
    let (mut sender, mut receiver) = socket.split();
    let ping_interval = signaling.transport.ping_interval;
    let idle_timeout = signaling.transport.idle_timeout;

    counter!("call_relay_connections_total", 1);
    gauge!(
        "call_relay_connections_active",
        signaling.connections.len() as f64
    );
    info!(connection_id = %connection_id, remote_addr = %remote_addr, "websocket connected");

    let writer = tokio::spawn(async move {
        let mut ping = time::interval_at(time::Instant::now() + ping_interval, ping_interval);
        loop {
            let frame = tokio::select! {
                message = outbox.recv() => match message {
                    Some(message) => match message.to_json() {
                        Ok(json) => Message::Text(json),
                        Err(err) => {
                            warn!(connection_id = %connection_id, error = %err, "failed to encode message");
                            continue;
                        }
                    },
                    None => break,
                },
                _ = ping.tick() => Message::Ping(Vec::new()),
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let mut last_seen = time::Instant::now();
    loop {
        let frame = match time::timeout_at(last_seen + idle_timeout, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                counter!("call_relay_idle_disconnects_total", 1);
                info!(
                    connection_id = %connection_id,
                    idle_secs = idle_timeout.as_secs_f64(),
                    "client stopped responding"
                );
                break;
            }
        };
        last_seen = time::Instant::now();

        match frame {
            Message::Text(text) => dispatch(&signaling, connection_id, &text),
            // Some clients ship JSON in binary frames.
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch(&signaling, connection_id, text),
                Err(err) => {
                    debug!(
                        connection_id = %connection_id,
                        len = data.len(),
                        "rejecting non-UTF8 binary frame"
                    );
                    signaling
                        .router
                        .reject_malformed(connection_id, format!("invalid message: {err}"));
                }
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    signaling.router.disconnect(connection_id);
    signaling.connections.close(connection_id);
    writer.abort();

    gauge!(
        "call_relay_connections_active",
        signaling.connections.len() as f64
    );
    info!(connection_id = %connection_id, "websocket disconnected");
}

fn dispatch(signaling: &SignalingState, connection: ConnectionId, text: &str) {
    match ClientMessage::from_json(text) {
        Ok(message) => {
            debug!(connection_id = %connection, kind = message.kind(), "client message");
            signaling.router.handle(connection, message);
        }
        Err(err) => {
            warn!(connection_id = %connection, error = %err, "invalid client message");
            signaling
                .router
                .reject_malformed(connection, format!("invalid message: {err}"));
        }
    }
}
