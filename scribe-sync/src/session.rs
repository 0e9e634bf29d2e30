//! Join/resync state machine, one instance per connection generation.
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──open──► AwaitingSync ──sync_init──► Synced
//!                                                     ▲                         │
//!                                                     └──────────close──────────┘
//! ```
//!
//! The session only tracks where the handshake is. It never touches the
//! replica or the transport itself; the engine asks it whether a transition
//! is allowed and acts on the answer.

use std::fmt;

/// Handshake progress for one connection generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    AwaitingSync,
    Synced,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connecting => "connecting",
            SyncState::AwaitingSync => "awaiting_sync",
            SyncState::Synced => "synced",
        };
        f.write_str(name)
    }
}

/// User-facing connectivity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// No open connection.
    Disconnected,
    /// Connected, handshake not finished.
    Syncing,
    /// Connected and synced; local edits are being broadcast.
    Synced,
}

/// A transition the current state does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {state}")]
pub struct TransitionError {
    pub action: &'static str,
    pub state: SyncState,
}

/// Sync session bound to one connection generation.
#[derive(Debug, Clone)]
pub struct SyncSession {
    generation: u64,
    state: SyncState,
    transport_open: bool,
    ack_sent: bool,
}

impl SyncSession {
    /// Fresh session in `Disconnected`.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            state: SyncState::Disconnected,
            transport_open: false,
            ack_sent: false,
        }
    }

    /// Connection generation this session is bound to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current handshake state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether local edits may be broadcast.
    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Whether this session belongs to `generation`.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Collapse socket and handshake state into the user-facing indicator.
    pub fn connectivity(&self) -> Connectivity {
        match (self.transport_open, self.state) {
            (false, _) => Connectivity::Disconnected,
            (true, SyncState::Synced) => Connectivity::Synced,
            (true, _) => Connectivity::Syncing,
        }
    }

    /// `Disconnected → Connecting`.
    pub fn begin_connect(&mut self) -> Result<(), TransitionError> {
        self.expect(SyncState::Disconnected, "start connecting")?;
        self.state = SyncState::Connecting;
        Ok(())
    }

    /// `Connecting → AwaitingSync`.
    pub fn open(&mut self) -> Result<(), TransitionError> {
        self.expect(SyncState::Connecting, "open")?;
        self.state = SyncState::AwaitingSync;
        self.transport_open = true;
        Ok(())
    }

    /// Whether a `sync_init` would currently be acted upon.
    pub fn accepts_sync_init(&self) -> bool {
        self.transport_open && self.state == SyncState::AwaitingSync
    }

    /// `AwaitingSync → Synced`.
    ///
    /// Returns `true` the first time only, i.e. when the caller must send
    /// the `sync_ack`.
    pub fn complete_sync(&mut self) -> Result<bool, TransitionError> {
        self.expect(SyncState::AwaitingSync, "complete sync")?;
        self.state = SyncState::Synced;
        let send_ack = !self.ack_sent;
        self.ack_sent = true;
        Ok(send_ack)
    }

    /// Connection closed: fall back to `AwaitingSync` until the next
    /// generation replaces this session.
    pub fn close(&mut self) {
        self.transport_open = false;
        if matches!(self.state, SyncState::Synced | SyncState::AwaitingSync) {
            self.state = SyncState::AwaitingSync;
        } else {
            // Never opened: the attempt failed.
            self.state = SyncState::Disconnected;
        }
    }

    fn expect(&self, state: SyncState, action: &'static str) -> Result<(), TransitionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(TransitionError {
                action,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced(generation: u64) -> SyncSession {
        let mut session = SyncSession::new(generation);
        session.begin_connect().unwrap();
        session.open().unwrap();
        assert!(session.complete_sync().unwrap());
        session
    }

    #[test]
    fn test_initial_state() {
        let session = SyncSession::new(1);
        assert_eq!(session.state(), SyncState::Disconnected);
        assert_eq!(session.connectivity(), Connectivity::Disconnected);
        assert_eq!(session.generation(), 1);
        assert!(session.is_current(1));
        assert!(!session.is_current(2));
    }

    #[test]
    fn test_forward_path() {
        let mut session = SyncSession::new(1);
        session.begin_connect().unwrap();
        assert_eq!(session.state(), SyncState::Connecting);
        assert_eq!(session.connectivity(), Connectivity::Disconnected);

        session.open().unwrap();
        assert_eq!(session.state(), SyncState::AwaitingSync);
        assert_eq!(session.connectivity(), Connectivity::Syncing);
        assert!(session.accepts_sync_init());

        assert!(session.complete_sync().unwrap());
        assert!(session.is_synced());
        assert_eq!(session.connectivity(), Connectivity::Synced);
    }

    #[test]
    fn test_no_state_skipped() {
        let mut session = SyncSession::new(1);
        assert!(session.open().is_err());
        assert!(session.complete_sync().is_err());
        session.begin_connect().unwrap();
        assert!(session.complete_sync().is_err());
        assert!(session.begin_connect().is_err());
    }

    #[test]
    fn test_second_sync_init_rejected() {
        let mut session = synced(1);
        assert!(!session.accepts_sync_init());
        let err = session.complete_sync().unwrap_err();
        assert_eq!(err.state, SyncState::Synced);
    }

    #[test]
    fn test_close_resets_to_awaiting_sync() {
        let mut session = synced(1);
        session.close();
        assert_eq!(session.state(), SyncState::AwaitingSync);
        assert_eq!(session.connectivity(), Connectivity::Disconnected);
        // A closed generation never reopens.
        assert!(!session.accepts_sync_init());
        assert!(session.open().is_err());
    }

    #[test]
    fn test_close_before_open() {
        let mut session = SyncSession::new(3);
        session.begin_connect().unwrap();
        session.close();
        assert_eq!(session.state(), SyncState::Disconnected);
    }

    #[test]
    fn test_transition_error_message() {
        let err = SyncSession::new(1).open().unwrap_err();
        assert_eq!(err.to_string(), "cannot open while disconnected");
    }
}
