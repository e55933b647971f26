//! Relay WebSocket server.
//!
//! Accepts any number of agent connections, upgrades each to WebSocket and
//! runs its pumps against the [`RelayServer`] handler. A sweeper task fails
//! sessions that stopped making progress.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use pullwire_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection;
use crate::relay::RelayServer;

impl RelayServer {
    /// Accepts agent connections on `listener` until [`shutdown`] is called.
    ///
    /// [`shutdown`]: RelayServer::shutdown
    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        tracing::info!("relay listening on {local_addr}");

        tokio::spawn(Arc::clone(self).sweep(self.cancel.child_token()));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("relay shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection to WebSocket and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await?;
        tracing::info!(%peer_addr, "WebSocket connection established");

        let conn = connection::spawn_connection(
            ws_stream,
            peer_addr.to_string(),
            Arc::clone(self),
            self.cancel.clone(),
        );
        tracing::debug!(conn = conn.id(), %peer_addr, "connection pumps started");
        Ok(())
    }

    /// Periodically expires idle sessions.
    async fn sweep(self: Arc<Self>, cancel: CancellationToken) {
        let period = sweep_period(self.config.session_timeout);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let expired = self.expire_idle(Instant::now()).await;
                    if expired > 0 {
                        tracing::info!(expired, "expired idle sessions");
                    }
                }
            }
        }
    }
}

/// Frame limits for agent sockets; anything larger is a protocol error.
fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(WS_MAX_MESSAGE_SIZE))
        .max_frame_size(Some(WS_MAX_MESSAGE_SIZE))
}

fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 4).max(Duration::from_secs(1))
}
