//! The sync engine: one task, one replica, one live session.
//!
//! ```text
//! TransportEvent ──► handle_event ──► SyncSession (generation gate)
//!                         │
//!                         ▼
//!                  Message::decode ──► dispatch ──► Replica::apply
//!                                                        │
//! EditCommand ───► apply_edit ──► Replica::insert/delete │
//!                                        │               │
//!                                        ▼               ▼
//!                                  ReplicaChange stream ──► UpdateBroadcaster ──► FrameSink
//! ```
//!
//! Everything runs serialized on the engine task, so the replica needs no
//! lock. `UpdateBroadcast` frames are merged in every session state,
//! including before the handshake finishes: the merge is order-independent,
//! so an early delta lands in the same place it would after the baseline.

use tokio::sync::{mpsc, watch};

use crate::broadcaster::{BroadcastStats, UpdateBroadcaster};
use crate::protocol::{Frame, Message, SyncSource};
use crate::replica::{ChangeReceiver, Origin, Replica, ReplicaError};
use crate::session::{Connectivity, SyncSession, SyncState};
use crate::transport::{FrameSink, TransportEvent};

/// Local edit requested by the application. Positions are in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditCommand {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
    /// Insert at the end of the text as it stands when the engine applies it.
    Append { text: String },
    /// Replace the whole visible text, applied as a minimal splice.
    Replace { text: String },
}

/// Owns the replica and drives it from transport events and local edits.
pub struct SyncEngine<R, S> {
    replica: R,
    changes: ChangeReceiver,
    session: SyncSession,
    broadcaster: UpdateBroadcaster,
    sink: S,
    text_tx: watch::Sender<String>,
    connectivity_tx: watch::Sender<Connectivity>,
}

impl<R: Replica, S: FrameSink> SyncEngine<R, S> {
    /// Take ownership of the replica and the transport's send capability.
    pub fn new(mut replica: R, sink: S) -> Self {
        let changes = replica.subscribe();
        let session = SyncSession::new(0);
        let (text_tx, _) = watch::channel(replica.text());
        let (connectivity_tx, _) = watch::channel(session.connectivity());
        Self {
            replica,
            changes,
            session,
            broadcaster: UpdateBroadcaster::new(),
            sink,
            text_tx,
            connectivity_tx,
        }
    }

    /// Handshake state of the current generation.
    pub fn state(&self) -> SyncState {
        self.session.state()
    }

    /// Generation of the session being tracked; 0 before the first dial.
    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    /// Indicator derived from the current session.
    pub fn connectivity(&self) -> Connectivity {
        self.session.connectivity()
    }

    /// Current document text, straight from the replica.
    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn replica(&self) -> &R {
        &self.replica
    }

    /// Counters from the update broadcaster.
    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    /// Document view, refreshed after every change.
    pub fn watch_text(&self) -> watch::Receiver<String> {
        self.text_tx.subscribe()
    }

    /// Coarse indicator for status displays.
    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity_tx.subscribe()
    }

    /// Drive the engine until the transport's event stream ends.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut edits: mpsc::Receiver<EditCommand>,
    ) {
        let mut edits_open = true;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                edit = edits.recv(), if edits_open => match edit {
                    Some(edit) => {
                        if let Err(e) = self.apply_edit(edit) {
                            log::warn!("Rejected local edit: {e}");
                        }
                    }
                    None => edits_open = false,
                },
            }
        }
        log::info!("Transport stopped; sync engine exiting");
    }

    /// Advance the session on a transport event. Events for older
    /// generations are ignored.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting { generation } => self.start_generation(generation),
            TransportEvent::Opened { generation } => {
                if generation > self.session.generation() {
                    // Dial was never reported; walk through Connecting.
                    self.start_generation(generation);
                }
                if !self.session.is_current(generation) {
                    log::debug!("Ignoring open for stale generation {generation}");
                } else if let Err(e) = self.session.open() {
                    log::warn!("Protocol error on open (generation {generation}): {e}");
                } else {
                    log::info!("Connection {generation} open; awaiting sync");
                }
            }
            TransportEvent::Frame { generation, frame } => {
                if self.session.is_current(generation) {
                    self.handle_frame(&frame);
                } else {
                    log::debug!(
                        "Dropping {} byte frame from stale generation {generation}",
                        frame.len()
                    );
                }
            }
            TransportEvent::Closed { generation } => {
                if self.session.is_current(generation) {
                    self.session.close();
                    log::info!(
                        "Connection {generation} closed; session now {}",
                        self.session.state()
                    );
                } else {
                    log::debug!("Ignoring close for stale generation {generation}");
                }
            }
        }
        self.publish();
    }

    /// Decode and dispatch one frame; undecodable frames are logged and dropped.
    pub fn handle_frame(&mut self, frame: &Frame) {
        match Message::decode(frame) {
            Ok(message) => self.handle_message(message),
            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
        }
    }

    /// Dispatch a decoded message against the current session.
    pub fn handle_message(&mut self, message: Message) {
        log::debug!("Received {} in state {}", message.kind(), self.session.state());
        match message {
            Message::SyncInit { source, state } => self.on_sync_init(source, state),
            Message::SyncRequest { requester_id } => self.on_sync_request(requester_id),
            Message::UpdateBroadcast { content } => {
                if let Err(e) = self.replica.apply(&content, Origin::Remote) {
                    log::error!("Failed to apply remote update: {e}");
                } else if !self.session.is_synced() {
                    log::debug!("Applied remote update before sync completed");
                }
            }
            Message::SyncAck | Message::SyncResponse { .. } => {
                log::warn!("Unexpected {} from server; ignoring", message.kind());
            }
        }
        self.pump_changes();
        self.publish();
    }

    /// Apply a local edit and broadcast the resulting delta if synced.
    pub fn apply_edit(&mut self, edit: EditCommand) -> Result<(), ReplicaError> {
        let result = match edit {
            EditCommand::Insert { index, text } => self.replica.insert(index, &text),
            EditCommand::Delete { index, len } => self.replica.delete(index, len),
            EditCommand::Append { text } => {
                let end = self.replica.char_len();
                self.replica.insert(end, &text)
            }
            EditCommand::Replace { text } => self.replica.replace_text(&text),
        };
        self.pump_changes();
        self.publish();
        result
    }

    fn start_generation(&mut self, generation: u64) {
        if generation <= self.session.generation() {
            log::debug!("Ignoring connect for stale generation {generation}");
            return;
        }
        self.session = SyncSession::new(generation);
        if let Err(e) = self.session.begin_connect() {
            log::warn!("Protocol error on connect (generation {generation}): {e}");
        }
    }

    fn on_sync_init(&mut self, source: SyncSource, state: Option<Vec<u8>>) {
        if !self.session.accepts_sync_init() {
            log::warn!("Ignoring sync_init while {}", self.session.state());
            return;
        }

        match (source, state) {
            (SyncSource::Db, _) => {
                log::info!("First client in session; starting from local state");
            }
            (SyncSource::Peer, Some(bytes)) => {
                if let Err(e) = self.replica.apply(&bytes, Origin::Remote) {
                    log::error!("Failed to apply peer state; still awaiting sync: {e}");
                    return;
                }
            }
            (SyncSource::Peer, None) => {
                log::error!("sync_init from peer carried no state; still awaiting sync");
                return;
            }
        }

        match self.session.complete_sync() {
            Ok(true) => {
                self.send(Message::SyncAck);
                log::info!("Synced (generation {})", self.session.generation());
            }
            Ok(false) => {}
            Err(e) => log::warn!("Protocol error on sync_init: {e}"),
        }
    }

    fn on_sync_request(&mut self, requester_id: String) {
        let state = self.replica.encode_full_state();
        log::info!(
            "Answering sync_request from {requester_id} with {} bytes of state",
            state.len()
        );
        self.send(Message::SyncResponse {
            target_id: requester_id,
            state,
        });
    }

    /// Send on behalf of the current session. The sink drops the frame if
    /// the transport has moved on to a newer generation.
    fn send(&self, message: Message) {
        let kind = message.kind();
        match message.encode() {
            Ok(frame) => {
                if let Err(e) = self.sink.send_frame(self.session.generation(), frame) {
                    log::warn!("Failed to send {kind}: {e}");
                }
            }
            Err(e) => log::error!("Failed to encode {kind}: {e}"),
        }
    }

    fn pump_changes(&mut self) {
        while let Ok(change) = self.changes.try_recv() {
            self.broadcaster.forward(change, &self.session, &self.sink);
        }
    }

    fn publish(&self) {
        let text = self.replica.text();
        self.text_tx.send_if_modified(|current| {
            if *current == text {
                false
            } else {
                *current = text;
                true
            }
        });
        let connectivity = self.session.connectivity();
        self.connectivity_tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
    }
}
