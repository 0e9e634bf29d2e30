//! JSON envelope codec for the collaboration wire protocol.
//!
//! Wire format (text frames):
//! ```text
//! { "type": "sync_request",  "requester_id": "<id>" }
//! { "type": "sync_response", "target_id": "<id>", "state": "<base64>" }
//! { "type": "sync_init",     "source": "db" | "peer", "state"?: "<base64>" }
//! { "type": "sync_ack" }
//! { "type": "yjs_update",    "content": "<base64>" }
//! ```
//!
//! Binary frames skip the envelope entirely: their payload is a raw CRDT
//! update and decodes straight to [`Message::UpdateBroadcast`].

use serde::{Deserialize, Serialize};

/// One WebSocket frame, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON envelope
    Text(String),
    /// Raw CRDT update bytes
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a joining client's baseline state comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    /// First client in the session: nothing to merge.
    Db,
    /// State was captured from a peer already in the session.
    Peer,
}

/// Top-level protocol message.
///
/// The set is closed: an envelope carrying any other `type` tag fails to
/// decode instead of being silently skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A newly joined peer asks for the full document state.
    SyncRequest { requester_id: String },
    /// Full state answer routed back to `target_id`.
    SyncResponse {
        target_id: String,
        #[serde(serialize_with = "b64::encode")]
        state: Vec<u8>,
    },
    /// Server tells a joining client where its baseline comes from.
    SyncInit {
        source: SyncSource,
        #[serde(skip_serializing_if = "Option::is_none", serialize_with = "b64::encode_opt")]
        state: Option<Vec<u8>>,
    },
    /// Client confirms it reached `Synced`.
    SyncAck,
    /// Incremental CRDT delta.
    #[serde(rename = "yjs_update")]
    UpdateBroadcast {
        #[serde(serialize_with = "b64::encode")]
        content: Vec<u8>,
    },
}

/// Text frame as it arrives, with binary payloads still base64 encoded.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    SyncRequest {
        requester_id: String,
    },
    SyncResponse {
        target_id: String,
        state: String,
    },
    SyncInit {
        source: SyncSource,
        #[serde(default)]
        state: Option<String>,
    },
    SyncAck,
    #[serde(rename = "yjs_update")]
    UpdateBroadcast {
        content: String,
    },
}

impl TryFrom<Envelope> for Message {
    type Error = CodecError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        Ok(match envelope {
            Envelope::SyncRequest { requester_id } => Message::SyncRequest { requester_id },
            Envelope::SyncResponse { target_id, state } => Message::SyncResponse {
                target_id,
                state: b64::decode(&state)?,
            },
            Envelope::SyncInit { source, state } => Message::SyncInit {
                source,
                state: state.as_deref().map(b64::decode).transpose()?,
            },
            Envelope::SyncAck => Message::SyncAck,
            Envelope::UpdateBroadcast { content } => Message::UpdateBroadcast {
                content: b64::decode(&content)?,
            },
        })
    }
}

impl Message {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SyncRequest { .. } => "sync_request",
            Message::SyncResponse { .. } => "sync_response",
            Message::SyncInit { .. } => "sync_init",
            Message::SyncAck => "sync_ack",
            Message::UpdateBroadcast { .. } => "yjs_update",
        }
    }

    /// Encode into a text frame.
    pub fn encode(&self) -> Result<Frame, CodecError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(CodecError::Encode)
    }

    /// Decode an inbound frame.
    ///
    /// A binary frame is taken as raw update bytes; a text frame must be a
    /// well-formed envelope with a known tag and valid base64 payloads.
    pub fn decode(frame: &Frame) -> Result<Self, CodecError> {
        match frame {
            Frame::Binary(bytes) => Ok(Message::UpdateBroadcast {
                content: bytes.clone(),
            }),
            Frame::Text(text) => Self::decode_text(text),
        }
    }

    /// Decode a JSON envelope.
    pub fn decode_text(text: &str) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(CodecError::Json)?;
        Message::try_from(envelope)
    }
}

/// Codec errors. None of these are fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Standard padded base64 for binary payloads.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::{DecodeError, Engine};
    use serde::Serializer;

    pub fn encode<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn encode_opt<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn decode(encoded: &str) -> Result<Vec<u8>, DecodeError> {
        STANDARD.decode(encoded.as_bytes())
    }
}
