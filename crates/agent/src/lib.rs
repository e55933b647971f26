//! Agent side of pullwire.
//!
//! The agent dials out to the relay, registers under its client id and
//! waits. When the relay sends a `download_request`, the configured file is
//! streamed back through a [`FlowController`](pullwire_transfer::FlowController).
//! Lost connections are re-dialed with exponential backoff.

mod client;
mod dispatch;
mod outbound;
mod pumps;
pub mod types;

pub use client::{Agent, AgentConnection, REGISTRATION_TIMEOUT};
pub use types::{AgentOptions, ReconnectConfig};

use tokio_tungstenite::tungstenite;

/// Errors from the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("relay rejected registration: {0}")]
    Rejected(String),

    #[error("registration timed out")]
    RegistrationTimeout,

    #[error("connection closed")]
    Closed,
}
