use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::MessageType;
use crate::messages::{
    ChunkPayload, CompletePayload, DownloadRequestPayload, ErrorPayload, RegisterPayload,
    RegisteredPayload,
};

/// Reasons a text frame could not be turned into an [`Envelope`].
///
/// All variants are non-fatal: the frame is logged and discarded and the
/// connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("{0} message has no payload")]
    MissingPayload(MessageType),

    #[error("invalid {msg_type} payload: {source}")]
    InvalidPayload {
        msg_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Every message exchanged on a relay/agent connection.
///
/// Serializes as `{"type": "<tag>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Register(RegisterPayload),
    Registered(RegisteredPayload),
    DownloadRequest(DownloadRequestPayload),
    Chunk(ChunkPayload),
    Complete(CompletePayload),
    Error(ErrorPayload),
}

/// Undecoded frame: the tag is read eagerly, the payload is deferred until
/// the tag is known.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

impl Envelope {
    /// Decodes a text frame into a typed envelope.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let RawEnvelope { tag, payload } =
            serde_json::from_str(text).map_err(EnvelopeError::Json)?;
        let msg_type: MessageType = serde_json::from_value(serde_json::Value::String(tag.clone()))
            .map_err(EnvelopeError::Json)?;
        let payload = match (msg_type, payload) {
            (MessageType::Unknown, _) => return Err(EnvelopeError::UnknownType(tag)),
            (_, None) => return Err(EnvelopeError::MissingPayload(msg_type)),
            (_, Some(p)) => p,
        };

        match msg_type {
            MessageType::Register => payload_of(msg_type, &payload).map(Envelope::Register),
            MessageType::Registered => payload_of(msg_type, &payload).map(Envelope::Registered),
            MessageType::DownloadRequest => {
                payload_of(msg_type, &payload).map(Envelope::DownloadRequest)
            }
            MessageType::Chunk => payload_of(msg_type, &payload).map(Envelope::Chunk),
            MessageType::Complete => payload_of(msg_type, &payload).map(Envelope::Complete),
            MessageType::Error => payload_of(msg_type, &payload).map(Envelope::Error),
            MessageType::Unknown => Err(EnvelopeError::UnknownType(tag)),
        }
    }

    /// Encodes the envelope as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the wire tag of this envelope.
    pub fn msg_type(&self) -> MessageType {
        match self {
            Envelope::Register(_) => MessageType::Register,
            Envelope::Registered(_) => MessageType::Registered,
            Envelope::DownloadRequest(_) => MessageType::DownloadRequest,
            Envelope::Chunk(_) => MessageType::Chunk,
            Envelope::Complete(_) => MessageType::Complete,
            Envelope::Error(_) => MessageType::Error,
        }
    }

    /// Returns the session this envelope refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Envelope::DownloadRequest(p) => Some(&p.session_id),
            Envelope::Chunk(p) => Some(&p.session_id),
            Envelope::Complete(p) => Some(&p.session_id),
            Envelope::Error(p) => p.session_id.as_deref(),
            Envelope::Register(_) | Envelope::Registered(_) => None,
        }
    }

    /// Creates an `error` envelope.
    pub fn error(session_id: Option<&str>, message: impl Into<String>) -> Self {
        Envelope::Error(ErrorPayload {
            session_id: session_id.map(str::to_owned),
            message: message.into(),
        })
    }
}

fn payload_of<T: for<'de> Deserialize<'de>>(
    msg_type: MessageType,
    raw: &RawValue,
) -> Result<T, EnvelopeError> {
    serde_json::from_str(raw.get())
        .map_err(|source| EnvelopeError::InvalidPayload { msg_type, source })
}
