//! Forwards locally-originated replica deltas to the network.
//!
//! Two gates, in order:
//! 1. origin must be `Local`; remote changes were just received from the
//!    network and are never echoed back.
//! 2. the session must be `Synced`; earlier local edits stay in the replica
//!    and reach peers through the next full-state `sync_response`.
//!
//! Forwarded frames carry the session's generation, so a delta produced
//! for a connection that has since been replaced is dropped by the sink.

use crate::protocol::Message;
use crate::replica::{Origin, ReplicaChange};
use crate::session::SyncSession;
use crate::transport::FrameSink;

/// What happened to one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// Handed to the sink.
    Sent,
    SkippedRemote,
    SkippedUnsynced,
    SendFailed,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub sent: u64,
    pub suppressed_remote: u64,
    pub held_unsynced: u64,
    pub failed: u64,
}

/// Gate between replica change notifications and the network.
#[derive(Debug, Default)]
pub struct UpdateBroadcaster {
    stats: BroadcastStats,
}

impl UpdateBroadcaster {
    /// Broadcaster with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate one change and, if it passes, send it as a `yjs_update` stamped
    /// with the session's generation.
    pub fn forward<S: FrameSink + ?Sized>(
        &mut self,
        change: ReplicaChange,
        session: &SyncSession,
        sink: &S,
    ) -> Forwarded {
        if change.origin == Origin::Remote {
            self.stats.suppressed_remote += 1;
            return Forwarded::SkippedRemote;
        }
        if !session.is_synced() {
            log::debug!(
                "Holding {} byte local update until sync completes",
                change.delta.len()
            );
            self.stats.held_unsynced += 1;
            return Forwarded::SkippedUnsynced;
        }

        let message = Message::UpdateBroadcast {
            content: change.delta,
        };
        let result = message
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|frame| {
                sink.send_frame(session.generation(), frame)
                    .map_err(|e| e.to_string())
            });

        match result {
            Ok(()) => {
                self.stats.sent += 1;
                Forwarded::Sent
            }
            Err(e) => {
                log::warn!("Failed to broadcast local update: {e}");
                self.stats.failed += 1;
                Forwarded::SendFailed
            }
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::recording::RecordingSink;

    fn synced_session(generation: u64) -> SyncSession {
        let mut session = SyncSession::new(generation);
        session.begin_connect().unwrap();
        session.open().unwrap();
        session.complete_sync().unwrap();
        session
    }

    fn awaiting_session() -> SyncSession {
        let mut session = SyncSession::new(1);
        session.begin_connect().unwrap();
        session.open().unwrap();
        session
    }

    fn change(origin: Origin) -> ReplicaChange {
        ReplicaChange {
            delta: vec![1, 2, 3],
            origin,
        }
    }

    #[test]
    fn test_local_change_sent_when_synced() {
        let sink = RecordingSink::new();
        let mut broadcaster = UpdateBroadcaster::new();

        assert_eq!(
            broadcaster.forward(change(Origin::Local), &synced_session(3), &sink),
            Forwarded::Sent
        );
        assert_eq!(
            sink.take_stamped(),
            vec![(
                3,
                Message::UpdateBroadcast {
                    content: vec![1, 2, 3]
                }
            )]
        );
        assert_eq!(broadcaster.stats().sent, 1);
    }

    #[test]
    fn test_remote_change_never_echoed() {
        let sink = RecordingSink::new();
        let mut broadcaster = UpdateBroadcaster::new();

        assert_eq!(
            broadcaster.forward(change(Origin::Remote), &synced_session(1), &sink),
            Forwarded::SkippedRemote
        );
        assert!(sink.take().is_empty());
        assert_eq!(broadcaster.stats().suppressed_remote, 1);
    }

    #[test]
    fn test_local_change_held_until_synced() {
        let sink = RecordingSink::new();
        let mut broadcaster = UpdateBroadcaster::new();

        assert_eq!(
            broadcaster.forward(change(Origin::Local), &awaiting_session(), &sink),
            Forwarded::SkippedUnsynced
        );
        assert!(sink.take().is_empty());
        assert_eq!(broadcaster.stats().held_unsynced, 1);
    }

    #[test]
    fn test_send_failure_counted() {
        let sink = RecordingSink::new();
        sink.set_open(false);
        let mut broadcaster = UpdateBroadcaster::new();

        assert_eq!(
            broadcaster.forward(change(Origin::Local), &synced_session(1), &sink),
            Forwarded::SendFailed
        );
        assert_eq!(broadcaster.stats().failed, 1);
    }
}
