//! WebSocket relay with session-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── sync_init / sync_request routing
//!             ├── /ws/document/{s} ── Room(s)
//! Client B ──┘                         └── yjs_update fan-out (N-1 peers)
//! ```
//!
//! The relay is stateless with respect to document content: it never
//! decodes CRDT bytes, it only reads envelope tags to decide where a frame
//! goes. Tokens in the query string are accepted and ignored.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::{Frame, Message};
use crate::rooms::{PeerId, RoomManager, RoomStats};
use crate::transport::into_ws;

const DOCUMENT_PATH: &str = "/ws/document/";

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rooms: RoomStats,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
}

/// The relay server.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    connections: Arc<ConnectionCounters>,
}

impl Relay {
    /// Bind the listening socket. Use port 0 to let the OS pick one.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config,
            rooms: Arc::new(RoomManager::new()),
            connections: Arc::new(ConnectionCounters::default()),
        })
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Base URL clients should dial, e.g. `ws://127.0.0.1:9001`.
    pub fn base_url(&self) -> Result<String, RelayError> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Connection counters plus room totals.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.connections.total.load(Ordering::Relaxed),
            active_connections: self.connections.active.load(Ordering::Relaxed),
            rooms: self.rooms.stats().await,
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let connections = self.connections.clone();
            let capacity = self.config.channel_capacity.max(1);

            tokio::spawn(async move {
                connections.total.fetch_add(1, Ordering::Relaxed);
                connections.active.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, rooms, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                connections.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// `/ws/document/{session}` → `session`.
fn session_from_path(path: &str) -> Option<String> {
    let session = path.strip_prefix(DOCUMENT_PATH)?.trim_end_matches('/');
    (!session.is_empty() && !session.contains('/')).then(|| session.to_string())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    capacity: usize,
) -> Result<(), RelayError> {
    let mut session = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match session_from_path(request.uri().path()) {
            Some(name) => {
                session = Some(name);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("unknown document path".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    })
    .await?;
    let Some(session) = session else {
        return Ok(());
    };

    let peer = Uuid::new_v4();
    let (outbox, inbox) = mpsc::channel(capacity);
    log::info!("WebSocket connection established from {addr} as {peer}");
    rooms.join(&session, peer, outbox).await;

    let result = pump(ws, inbox, &rooms, &session, peer).await;

    rooms.leave(&session, &peer).await;
    log::info!("Connection closed from {addr} ({peer})");
    result
}

async fn pump(
    ws: WebSocketStream<TcpStream>,
    mut inbox: mpsc::Receiver<Frame>,
    rooms: &RoomManager,
    session: &str,
    peer: PeerId,
) -> Result<(), RelayError> {
    let (mut writer, mut reader) = ws.split();

    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    route(rooms, session, peer, Frame::Text(text.as_str().to_owned())).await;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    route(rooms, session, peer, Frame::Binary(data.to_vec())).await;
                }
                Some(Ok(WsMessage::Ping(data))) => writer.send(WsMessage::Pong(data)).await?,
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {peer}: {e}");
                    return Ok(());
                }
            },

            outbound = inbox.recv() => match outbound {
                Some(frame) => writer.send(into_ws(frame)).await?,
                None => return Ok(()),
            },
        }
    }
}

/// Decide where one inbound frame goes.
async fn route(rooms: &RoomManager, session: &str, peer: PeerId, frame: Frame) {
    let message = match Message::decode(&frame) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Failed to decode frame from {peer}: {e}");
            return;
        }
    };

    match message {
        Message::UpdateBroadcast { .. } => {
            let delivered = rooms.fan_out(session, &peer, &frame).await;
            log::debug!("Relayed {} byte update from {peer} to {delivered} peers", frame.len());
        }
        Message::SyncResponse { target_id, state } => match Uuid::parse_str(&target_id) {
            Ok(joiner) => {
                rooms.respond(session, peer, joiner, state).await;
            }
            Err(_) => log::warn!("sync_response from {peer} names unknown peer {target_id:?}"),
        },
        Message::SyncAck => {
            rooms.mark_synced(session, &peer).await;
            log::info!("Peer {peer} synced in session {session}");
        }
        Message::SyncRequest { .. } | Message::SyncInit { .. } => {
            log::warn!("Ignoring {} sent by client {peer}", message.kind());
        }
    }
}
