//! Per-session peer registry for the relay.
//!
//! A room is every connection that joined the same session. The relay keeps
//! no document state of its own; it only decides who seeds a joiner:
//!
//! ```text
//! joiner J arrives
//!   ├── no other eligible peer ──► J ◄── sync_init{db}
//!   └── responder R chosen     ──► R ◄── sync_request{J}
//!                                  R ──► sync_response{J, state}
//!                                  J ◄── sync_init{peer, state}
//! ```
//!
//! Responders are picked oldest-first among synced peers, falling back to
//! any peer that is not itself waiting for a baseline. If a responder leaves
//! before answering, its joiners are planned again.
//!
//! Outbound frames go through each peer's bounded queue with `try_send`, so
//! a slow peer drops frames instead of stalling the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, Message, SyncSource};

pub type PeerId = Uuid;

/// Outbound frame queue of one connected peer.
pub type Outbox = mpsc::Sender<Frame>;

/// How a joining peer gets its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPlan {
    /// First in the session: start from local state.
    FromDb,
    /// An existing peer was asked for its state.
    FromPeer(PeerId),
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicRoomStats {
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Member {
    outbox: Outbox,
    synced: bool,
    seq: u64,
}

/// All peers of one session.
#[derive(Default)]
pub struct Room {
    members: HashMap<PeerId, Member>,
    /// joiner → responder asked to seed it
    pending: HashMap<PeerId, PeerId>,
    next_seq: u64,
    relayed: u64,
    dropped: u64,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the last peer has left.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `peer` is a member.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains_key(peer)
    }

    /// Whether `peer` has acked its `sync_init`.
    pub fn is_synced(&self, peer: &PeerId) -> bool {
        self.members.get(peer).is_some_and(|m| m.synced)
    }

    /// Responder currently asked to seed `joiner`, if any.
    pub fn pending_responder(&self, joiner: &PeerId) -> Option<PeerId> {
        self.pending.get(joiner).copied()
    }

    /// Add a peer and start its handshake.
    pub fn join(&mut self, peer: PeerId, outbox: Outbox) -> JoinPlan {
        self.next_seq += 1;
        self.members.insert(
            peer,
            Member {
                outbox,
                synced: false,
                seq: self.next_seq,
            },
        );
        self.plan(peer)
    }

    /// Route a responder's full state to the joiner that asked for it.
    pub fn respond(&mut self, responder: PeerId, joiner: PeerId, state: Vec<u8>) -> bool {
        match self.pending.get(&joiner) {
            Some(asked) if *asked == responder => {}
            Some(asked) => {
                log::debug!("Response for {joiner} from {responder}, expected {asked}; using it");
            }
            None => {
                log::warn!("Unsolicited sync_response for {joiner} from {responder}; dropping");
                return false;
            }
        }
        self.pending.remove(&joiner);
        self.send(
            &joiner,
            &Message::SyncInit {
                source: SyncSource::Peer,
                state: Some(state),
            },
        )
    }

    /// Record a peer's `sync_ack`.
    pub fn mark_synced(&mut self, peer: &PeerId) {
        if let Some(member) = self.members.get_mut(peer) {
            member.synced = true;
        }
    }

    /// Send `frame` unchanged to every peer except `from`.
    ///
    /// Returns the number of peers it was queued for.
    pub fn fan_out(&mut self, from: &PeerId, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = 0;
        for (id, member) in &self.members {
            if id == from {
                continue;
            }
            if deliver(id, member, frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        self.relayed += delivered as u64;
        self.dropped += dropped;
        delivered
    }

    /// Remove a peer. Joiners that were waiting on it are planned again.
    pub fn leave(&mut self, peer: &PeerId) -> Vec<(PeerId, JoinPlan)> {
        if self.members.remove(peer).is_none() {
            return Vec::new();
        }
        self.pending.remove(peer);

        let mut orphans: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, responder)| *responder == peer)
            .map(|(joiner, _)| *joiner)
            .collect();
        orphans.sort_by_key(|joiner| self.members.get(joiner).map(|m| m.seq));

        orphans
            .into_iter()
            .map(|joiner| {
                self.pending.remove(&joiner);
                log::info!("Responder {peer} left; re-planning join of {joiner}");
                (joiner, self.plan(joiner))
            })
            .collect()
    }

    fn plan(&mut self, joiner: PeerId) -> JoinPlan {
        match self.pick_responder(&joiner) {
            Some(responder) => {
                self.pending.insert(joiner, responder);
                self.send(
                    &responder,
                    &Message::SyncRequest {
                        requester_id: joiner.to_string(),
                    },
                );
                JoinPlan::FromPeer(responder)
            }
            None => {
                self.send(
                    &joiner,
                    &Message::SyncInit {
                        source: SyncSource::Db,
                        state: None,
                    },
                );
                JoinPlan::FromDb
            }
        }
    }

    fn pick_responder(&self, joiner: &PeerId) -> Option<PeerId> {
        let candidates = self
            .members
            .iter()
            .filter(|(id, _)| *id != joiner && !self.pending.contains_key(*id));

        let oldest_synced = candidates
            .clone()
            .filter(|(_, m)| m.synced)
            .min_by_key(|(_, m)| m.seq);
        oldest_synced
            .or_else(|| candidates.min_by_key(|(_, m)| m.seq))
            .map(|(id, _)| *id)
    }

    fn send(&mut self, to: &PeerId, message: &Message) -> bool {
        let Some(member) = self.members.get(to) else {
            return false;
        };
        match message.encode() {
            Ok(frame) => {
                let sent = deliver(to, member, frame);
                if sent {
                    self.relayed += 1;
                } else {
                    self.dropped += 1;
                }
                sent
            }
            Err(e) => {
                log::error!("Failed to encode {} for {to}: {e}", message.kind());
                false
            }
        }
    }
}

fn deliver(to: &PeerId, member: &Member, frame: Frame) -> bool {
    match member.outbox.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Peer {to} is lagging; dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::debug!("Peer {to} already gone; dropping frame");
            false
        }
    }
}

/// Room manager: maps session names to rooms.
///
/// Each session gets its own room so that frames are isolated between
/// different documents.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Room>>,
    stats: AtomicRoomStats,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicRoomStats::default(),
        }
    }

    /// Join `session`, creating the room on first use.
    pub async fn join(&self, session: &str, peer: PeerId, outbox: Outbox) -> JoinPlan {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(session.to_string()).or_default();
        let plan = self.tracked(room, |room| room.join(peer, outbox));
        log::info!(
            "Peer {peer} joined session {session} ({} peers, {plan:?})",
            room.len()
        );
        plan
    }

    /// Leave `session`; empty rooms are removed.
    pub async fn leave(&self, session: &str, peer: &PeerId) -> Vec<(PeerId, JoinPlan)> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(session) else {
            return Vec::new();
        };
        let replanned = self.tracked(room, |room| room.leave(peer));
        log::info!("Peer {peer} left session {session}");
        if room.is_empty() {
            rooms.remove(session);
            log::info!("Session {session} removed (empty)");
        }
        replanned
    }

    /// Route a `sync_response` to its pending joiner. Returns `false` if
    /// nobody in `session` was waiting for it.
    pub async fn respond(
        &self,
        session: &str,
        responder: PeerId,
        joiner: PeerId,
        state: Vec<u8>,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(session) {
            Some(room) => self.tracked(room, |room| room.respond(responder, joiner, state)),
            None => false,
        }
    }

    /// Record a `sync_ack`; the peer can now seed later joiners.
    pub async fn mark_synced(&self, session: &str, peer: &PeerId) {
        if let Some(room) = self.rooms.write().await.get_mut(session) {
            room.mark_synced(peer);
        }
    }

    /// Relay `frame` to every other peer in `session`; returns how many
    /// outboxes accepted it.
    pub async fn fan_out(&self, session: &str, from: &PeerId, frame: &Frame) -> usize {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(session) {
            Some(room) => self.tracked(room, |room| room.fan_out(from, frame)),
            None => 0,
        }
    }

    /// Number of sessions with at least one peer.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Peers in `session`; 0 for unknown sessions.
    pub async fn peer_count(&self, session: &str) -> usize {
        self.rooms.read().await.get(session).map_or(0, Room::len)
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Counter totals plus a live room and peer census.
    pub async fn stats(&self) -> RoomStats {
        let rooms = self.rooms.read().await;
        RoomStats {
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_peers: rooms.values().map(Room::len).sum(),
        }
    }

    /// Run `op` on a room and fold its frame counters into the totals.
    fn tracked<T>(&self, room: &mut Room, op: impl FnOnce(&mut Room) -> T) -> T {
        let result = op(room);
        self.stats
            .frames_relayed
            .fetch_add(std::mem::take(&mut room.relayed), Ordering::Relaxed);
        self.stats
            .frames_dropped
            .fetch_add(std::mem::take(&mut room.dropped), Ordering::Relaxed);
        result
    }
}
