//! Relay side of pullwire.
//!
//! Agents dial in over WebSocket and register under a client id. The relay
//! keeps them in a [`Registry`], asks a registered agent for its file with
//! [`RelayServer::request_download`], and reassembles the streamed chunks
//! into the downloads directory.

mod admin;
mod connection;
mod handler;
mod registry;
mod relay;
mod server;
mod sessions;

pub use admin::{ApiError, ClientSummary, DownloadTicket, HealthSnapshot, router, serve_admin};
pub use connection::{ConnectionHandle, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use registry::{ActiveDownload, Registry, RegistryEntry};
pub use relay::{RelayConfig, RelayServer, SessionHandle};
pub use sessions::{FINISHED_SESSIONS_KEPT, SessionBook};

/// Outbound frames buffered per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned to callers of [`RelayServer::request_download`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("client not connected: {0}")]
    ClientNotConnected(String),

    #[error("client {client_id} already has download {session_id} in progress")]
    DownloadInProgress {
        client_id: String,
        session_id: String,
    },
}
