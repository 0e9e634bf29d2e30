//! # scribe-sync: Real-time collaborative text synchronization
//!
//! Keeps a local CRDT replica of a shared text document converged with every
//! other client of the same session, over a reconnecting WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    JSON envelopes    ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────► │   Relay     │
//! │ (per user)  │   + raw yjs updates  │ (reference) │
//! └──────┬──────┘                      └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌─────────────┐
//! │ SyncEngine  │                      │ RoomManager │
//! │ session +   │                      │ join plan + │
//! │ replica     │                      │ fan-out     │
//! └──────┬──────┘                      └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ YrsReplica  │
//! │ (yrs Doc)   │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Tagged JSON envelopes with base64 payloads
//! - [`replica`]: `Replica` trait and the `yrs` implementation
//! - [`session`]: Join/resync handshake state machine
//! - [`transport`]: Reconnecting WebSocket with connection generations
//! - [`broadcaster`]: Echo-suppressing, sync-gated update forwarding
//! - [`engine`]: Single-task event loop tying the above together
//! - [`client`]: Spawns transport and engine, exposes edit/watch handles
//! - [`rooms`] / [`relay`]: Reference relay for local runs and tests
//! - [`config`]: Client and relay configuration

pub mod broadcaster;
pub mod client;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod relay;
pub mod replica;
pub mod rooms;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcaster::{BroadcastStats, Forwarded, UpdateBroadcaster};
pub use client::{ClientError, SyncClient};
pub use config::{ClientConfig, ConfigError, RelayConfig, Stage};
pub use engine::{EditCommand, SyncEngine};
pub use protocol::{CodecError, Frame, Message, SyncSource};
pub use relay::{Relay, RelayError, RelayStats};
pub use replica::{Origin, Replica, ReplicaChange, ReplicaError, YrsReplica};
pub use rooms::{JoinPlan, RoomManager, RoomStats};
pub use session::{Connectivity, SyncSession, SyncState, TransitionError};
pub use transport::{
    FrameSink, Transport, TransportError, TransportEvent, TransportHandle, TransportOptions,
};
