//! Sync client: transport plus engine, wired and spawned.
//!
//! Construction order matters. The transport is spawned first; the engine is
//! then built around the transport's [`TransportHandle`] as its frame sink,
//! so outbound messages never go through a late-bound lookup.
//!
//! ```text
//!  app ──EditCommand──► SyncEngine ──FrameSink──► Transport ──► server
//!   ▲                     │  ▲                        │
//!   └──watch(text,conn)───┘  └──────TransportEvent────┘
//! ```

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, ConfigError};
use crate::engine::{EditCommand, SyncEngine};
use crate::replica::{Replica, YrsReplica};
use crate::session::Connectivity;
use crate::transport::{Transport, TransportHandle};

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid client configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Sync engine has stopped")]
    EngineStopped,
}

/// Handle to a running sync client.
pub struct SyncClient {
    endpoint: String,
    transport: TransportHandle,
    edits: mpsc::Sender<EditCommand>,
    text: watch::Receiver<String>,
    connectivity: watch::Receiver<Connectivity>,
    transport_task: JoinHandle<()>,
    engine_task: JoinHandle<()>,
}

impl SyncClient {
    /// Start a client over an empty `yrs` document.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig) -> Result<Self, ClientError> {
        Self::start_with_replica(config, YrsReplica::new())
    }

    /// Start a client over a caller-supplied replica.
    pub fn start_with_replica<R>(config: ClientConfig, replica: R) -> Result<Self, ClientError>
    where
        R: Replica + Send + 'static,
    {
        let endpoint = config.endpoint_url()?;
        log::info!("Starting sync client for {}", config.session);

        let (transport, events, transport_task) =
            Transport::spawn(endpoint.clone(), config.transport_options());

        let engine = SyncEngine::new(replica, transport.clone());
        let text = engine.watch_text();
        let connectivity = engine.watch_connectivity();
        let (edits, edit_rx) = mpsc::channel(config.channel_capacity.max(1));
        let engine_task = tokio::spawn(engine.run(events, edit_rx));

        Ok(Self {
            endpoint,
            transport,
            edits,
            text,
            connectivity,
            transport_task,
            engine_task,
        })
    }

    /// Full endpoint URL, token included.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Insert `text` at char position `index`.
    pub async fn insert(&self, index: usize, text: impl Into<String>) -> Result<(), ClientError> {
        self.edit(EditCommand::Insert {
            index,
            text: text.into(),
        })
        .await
    }

    /// Remove `len` chars starting at `index`.
    pub async fn delete(&self, index: usize, len: usize) -> Result<(), ClientError> {
        self.edit(EditCommand::Delete { index, len }).await
    }

    /// Add `text` at the end of the document.
    ///
    /// The end is resolved when the engine applies the edit, not from
    /// [`SyncClient::text`], which may not yet reflect edits still queued.
    pub async fn append(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.edit(EditCommand::Append { text: text.into() }).await
    }

    /// Replace the whole text; only the changed middle is sent.
    pub async fn replace_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.edit(EditCommand::Replace { text: text.into() }).await
    }

    /// Queue an edit for the engine.
    pub async fn edit(&self, edit: EditCommand) -> Result<(), ClientError> {
        self.edits
            .send(edit)
            .await
            .map_err(|_| ClientError::EngineStopped)
    }

    /// Current document text.
    pub fn text(&self) -> String {
        self.text.borrow().clone()
    }

    /// Receiver that changes whenever the document text does.
    pub fn watch_text(&self) -> watch::Receiver<String> {
        self.text.clone()
    }

    /// Current indicator value.
    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }

    /// Wait until the indicator reads `target`.
    pub async fn wait_for_connectivity(&self, target: Connectivity) -> Result<(), ClientError> {
        let mut rx = self.connectivity.clone();
        rx.wait_for(|c| *c == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::EngineStopped)
    }

    /// Wait until the text satisfies `predicate` and return it.
    pub async fn wait_for_text<F>(&self, predicate: F) -> Result<String, ClientError>
    where
        F: FnMut(&String) -> bool,
    {
        let mut rx = self.text.clone();
        let text = rx
            .wait_for(predicate)
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        Ok(text.clone())
    }

    /// Whether the socket is currently open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        log::info!("Disconnecting from {}", self.endpoint);
        self.transport.disconnect();
    }

    /// Resume reconnecting after [`SyncClient::disconnect`].
    pub fn reconnect(&self) {
        log::info!("Reconnecting to {}", self.endpoint);
        self.transport.reconnect();
    }

    /// Stop the transport and wait for both tasks to finish.
    pub async fn shutdown(self) {
        self.transport.shutdown();
        if let Err(e) = self.transport_task.await {
            log::error!("Transport task failed: {e}");
        }
        drop(self.edits);
        if let Err(e) = self.engine_task.await {
            log::error!("Sync engine task failed: {e}");
        }
        log::info!("Sync client for {} stopped", self.endpoint);
    }
}
