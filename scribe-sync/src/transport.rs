//! Reconnecting WebSocket transport.
//!
//! One background task owns the socket. It dials the endpoint, forwards
//! every inbound frame as a [`TransportEvent`], writes outbound frames
//! handed to it through [`TransportHandle::send`], and after a close waits
//! a fixed interval before dialing again.
//!
//! ```text
//!              ┌──────────── reconnect_interval ◄──────────┐
//!              ▼                                            │
//! Connecting{g} ──ok──► Opened{g} ──► Frame{g}* ──► Closed{g}
//!      │                                                    ▲
//!      └──────────────────── refused ───────────────────────┘
//! ```
//!
//! Every attempt gets a new generation `g`. Callers stamp outbound frames
//! with the generation they were produced for; a frame whose stamp is not
//! the live socket's generation is dropped, so nothing meant for one
//! connection leaks onto the next.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::Frame;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect behavior.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Dial again after a close.
    pub reconnect: bool,
    /// Fixed delay between attempts.
    pub reconnect_interval: Duration,
    /// Inbound event buffer.
    pub channel_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_interval: Duration::from_millis(3000),
            channel_capacity: 256,
        }
    }
}

/// Events delivered to the sync engine, in socket order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt started.
    Connecting { generation: u64 },
    /// The WebSocket handshake completed.
    Opened { generation: u64 },
    /// Inbound frame.
    Frame { generation: u64, frame: Frame },
    /// The connection ended or the attempt failed.
    Closed { generation: u64 },
}

impl TransportEvent {
    /// Connection generation the event belongs to.
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::Connecting { generation }
            | TransportEvent::Opened { generation }
            | TransportEvent::Frame { generation, .. }
            | TransportEvent::Closed { generation } => *generation,
        }
    }
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket is not connected")]
    NotConnected,
    #[error("Frame for generation {stamped} dropped; connection is now generation {current}")]
    Superseded { stamped: u64, current: u64 },
    #[error("Transport task has stopped")]
    Closed,
}

/// Anything the engine can hand outbound frames to.
pub trait FrameSink {
    /// Queue `frame` for the connection of `generation`.
    fn send_frame(&self, generation: u64, frame: Frame) -> Result<(), TransportError>;
}

enum Command {
    Send { generation: u64, frame: Frame },
    Disconnect,
    Reconnect,
    Shutdown,
}

#[derive(Debug)]
struct Shared {
    open: AtomicBool,
    generation: AtomicU64,
    reconnect: AtomicBool,
}

/// Cloneable handle to the transport task.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Whether a socket is currently open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Generation of the current (or most recent) connection attempt.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Queue a frame for the connection of `generation`.
    ///
    /// Fails fast when nothing is open or a newer connection has replaced
    /// it. The worker checks the stamp again when it writes, since the
    /// socket can be replaced while the frame sits in the queue.
    pub fn send(&self, generation: u64, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            log::warn!("WebSocket is not connected; dropping {} byte frame", frame.len());
            return Err(TransportError::NotConnected);
        }
        let current = self.generation();
        if generation != current {
            log::debug!("Dropping frame for generation {generation}; live is {current}");
            return Err(TransportError::Superseded {
                stamped: generation,
                current,
            });
        }
        self.commands
            .send(Command::Send { generation, frame })
            .map_err(|_| TransportError::Closed)
    }

    /// Close the socket and stop reconnecting.
    pub fn disconnect(&self) {
        self.shared.reconnect.store(false, Ordering::Release);
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Re-enable reconnection and dial immediately if idle.
    pub fn reconnect(&self) {
        self.shared.reconnect.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Close the socket and end the transport task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl FrameSink for TransportHandle {
    fn send_frame(&self, generation: u64, frame: Frame) -> Result<(), TransportError> {
        self.send(generation, frame)
    }
}

/// Spawns the transport task.
pub struct Transport;

impl Transport {
    /// Start dialing `url` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        url: impl Into<String>,
        options: TransportOptions,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(options.channel_capacity.max(1));
        let shared = Arc::new(Shared {
            open: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect: AtomicBool::new(options.reconnect),
        });

        let worker = Worker {
            url: url.into(),
            interval: options.reconnect_interval,
            shared: shared.clone(),
            commands: command_rx,
            events: event_tx,
        };
        let task = tokio::spawn(worker.run());

        let handle = TransportHandle {
            commands: command_tx,
            shared,
        };
        (handle, event_rx, task)
    }
}

/// What the worker does next after a connection ends.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Dial,
    Stop,
}

struct Worker {
    url: String,
    interval: Duration,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            if !self.emit(TransportEvent::Connecting { generation }).await {
                break;
            }

            let next = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    log::info!("WebSocket connected (generation {generation})");
                    self.shared.open.store(true, Ordering::Release);
                    let next = if self.emit(TransportEvent::Opened { generation }).await {
                        self.pump(socket, generation).await
                    } else {
                        Next::Stop
                    };
                    self.shared.open.store(false, Ordering::Release);
                    log::info!("WebSocket disconnected (generation {generation})");
                    next
                }
                Err(e) => {
                    log::warn!("Connection attempt {generation} to {} failed: {e}", self.url);
                    Next::Dial
                }
            };

            if !self.emit(TransportEvent::Closed { generation }).await || next == Next::Stop {
                break;
            }
            if self.wait_before_dial().await == Next::Stop {
                break;
            }
            log::info!("Attempting to reconnect...");
        }
        log::debug!("Transport task for {} exiting", self.url);
    }

    /// Shuttle frames between the socket and the channels until either side
    /// goes away.
    async fn pump(&mut self, socket: Socket, generation: u64) -> Next {
        let (mut writer, mut reader) = socket.split();

        loop {
            tokio::select! {
                inbound = reader.next() => {
                    let frame = match inbound {
                        Some(Ok(WsMessage::Text(text))) => Frame::Text(text.as_str().to_owned()),
                        Some(Ok(WsMessage::Binary(data))) => Frame::Binary(data.to_vec()),
                        Some(Ok(WsMessage::Ping(data))) => {
                            if writer.send(WsMessage::Pong(data)).await.is_err() {
                                return Next::Dial;
                            }
                            continue;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Next::Dial,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error (generation {generation}): {e}");
                            return Next::Dial;
                        }
                    };
                    if !self.emit(TransportEvent::Frame { generation, frame }).await {
                        let _ = writer.send(WsMessage::Close(None)).await;
                        return Next::Stop;
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Send { generation: stamped, frame }) if stamped == generation => {
                        if let Err(e) = writer.send(into_ws(frame)).await {
                            log::warn!("WebSocket send failed (generation {generation}): {e}");
                            return Next::Dial;
                        }
                    }
                    Some(Command::Send { generation: stamped, .. }) => {
                        log::debug!("Dropping frame queued for stale generation {stamped}");
                    }
                    Some(Command::Disconnect) => {
                        let _ = writer.send(WsMessage::Close(None)).await;
                        return Next::Dial;
                    }
                    Some(Command::Reconnect) => {}
                    Some(Command::Shutdown) | None => {
                        let _ = writer.send(WsMessage::Close(None)).await;
                        return Next::Stop;
                    }
                },
            }
        }
    }

    /// Sleep out the retry interval, or park until told to reconnect when
    /// reconnection is disabled.
    async fn wait_before_dial(&mut self) -> Next {
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);

        loop {
            let reconnect = self.shared.reconnect.load(Ordering::Acquire);
            tokio::select! {
                _ = &mut sleep, if reconnect => return Next::Dial,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => return Next::Dial,
                    Some(Command::Shutdown) | None => return Next::Stop,
                    Some(Command::Disconnect) => {}
                    Some(Command::Send { generation, .. }) => {
                        log::debug!("Dropping frame for closed generation {generation}");
                    }
                },
            }
        }
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

pub(crate) fn into_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    #[test]
    fn test_default_options() {
        let options = TransportOptions::default();
        assert!(options.reconnect);
        assert_eq!(options.reconnect_interval, Duration::from_millis(3000));
        assert_eq!(options.channel_capacity, 256);
    }

    #[test]
    fn test_event_generation() {
        assert_eq!(TransportEvent::Connecting { generation: 4 }.generation(), 4);
        assert_eq!(
            TransportEvent::Frame {
                generation: 7,
                frame: Frame::Binary(vec![1]),
            }
            .generation(),
            7
        );
    }

    #[test]
    fn test_into_ws_preserves_kind() {
        assert!(matches!(into_ws(Frame::Text("{}".into())), WsMessage::Text(_)));
        assert!(matches!(into_ws(Frame::Binary(vec![1, 2])), WsMessage::Binary(_)));
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        // Nothing listens on port 1; the transport never opens.
        let options = TransportOptions {
            reconnect: false,
            ..TransportOptions::default()
        };
        let (handle, mut events, task) =
            Transport::spawn("ws://127.0.0.1:1/ws/document/x", options);

        assert!(matches!(
            handle.send(1, Frame::Text("{}".into())),
            Err(TransportError::NotConnected)
        ));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Connecting { generation: 1 })
        );
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Closed { generation: 1 })
        );
        assert!(!handle.is_open());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_for_replaced_connection_are_dropped() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, mut received) = mpsc::unbounded_channel();

        // Close connection 1 right away; report what connection 2 receives.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let WsMessage::Text(text) = message {
                    let _ = received_tx.send(text.as_str().to_owned());
                }
            }
        });

        let options = TransportOptions {
            reconnect: true,
            reconnect_interval: Duration::from_millis(20),
            channel_capacity: 16,
        };
        let (handle, mut events, task) =
            Transport::spawn(format!("ws://{addr}/ws/document/x"), options);
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == (TransportEvent::Opened { generation: 2 }) {
                break;
            }
        }

        // A reply produced while handling a generation 1 frame.
        let late_ack = Message::SyncAck.encode().unwrap();
        assert!(matches!(
            handle.send(1, late_ack),
            Err(TransportError::Superseded {
                stamped: 1,
                current: 2
            })
        ));

        let update = Message::UpdateBroadcast { content: vec![4] };
        handle.send(2, update.encode().unwrap()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode_text(&first).unwrap(), update);

        handle.shutdown();
        task.await.unwrap();
    }
}
