use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming frame).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Write idle time after which a transport-level ping is sent (must be <
/// [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum text frame size in bytes (16 MiB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum chunk payload size before base64 encoding (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size an agent may be configured with.
///
/// Base64 inflates by 4/3, so this keeps every chunk frame well under
/// [`WS_MAX_MESSAGE_SIZE`].
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// The receiver emits a progress observation every this many chunks.
pub const PROGRESS_EVERY_CHUNKS: u64 = 100;

/// WebSocket message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Agent to relay
    #[serde(rename = "register")]
    Register,
    #[serde(rename = "chunk")]
    Chunk,
    #[serde(rename = "complete")]
    Complete,

    // Relay to agent
    #[serde(rename = "registered")]
    Registered,
    #[serde(rename = "download_request")]
    DownloadRequest,

    // Either direction
    #[serde(rename = "error")]
    Error,

    /// Any tag this build does not know.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns the wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::Chunk => "chunk",
            MessageType::Complete => "complete",
            MessageType::Registered => "registered",
            MessageType::DownloadRequest => "download_request",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
