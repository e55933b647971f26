//! Agent connection lifecycle: dial, register, pump, reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pullwire_protocol::constants::WS_MAX_MESSAGE_SIZE;
use pullwire_protocol::envelope::Envelope;
use pullwire_protocol::messages::{ErrorPayload, RegisterPayload, RegisteredPayload};
use pullwire_transfer::{TransferSession, validate_identifier};

use crate::AgentError;
use crate::dispatch::Transfers;
use crate::outbound::Outbound;
use crate::types::AgentOptions;

/// How long to wait for the relay to acknowledge a registration.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound queue depth per connection.
const WRITE_BUFFER_SIZE: usize = 256;

/// A registered connection to the relay with its pumps running.
pub struct AgentConnection {
    transfers: Arc<Transfers>,
    cancel: CancellationToken,
    registered_at: Instant,
    _read_handle: JoinHandle<()>,
    _write_handle: JoinHandle<()>,
}

impl AgentConnection {
    /// Resolves once the connection has ended for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Closes the connection. Any transfer in progress is cut off.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The session currently streaming, if any.
    pub fn active_session(&self) -> Option<Arc<TransferSession>> {
        self.transfers.active()
    }

    /// Downloads streamed to completion over this connection.
    pub fn transfers_served(&self) -> u64 {
        self.transfers.served()
    }

    /// Time since the relay acknowledged the registration.
    pub fn uptime(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Long-lived agent: keeps one registered connection to the relay alive.
pub struct Agent {
    options: AgentOptions,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Stops [`run`](Agent::run) and closes the current connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Dials the relay and registers once.
    pub async fn connect(&self) -> Result<AgentConnection, AgentError> {
        let client_id = &self.options.client_id;
        validate_identifier(client_id).map_err(|e| AgentError::InvalidClientId(e.to_string()))?;

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(WS_MAX_MESSAGE_SIZE))
            .max_frame_size(Some(WS_MAX_MESSAGE_SIZE));
        let (mut ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(self.options.server_url.as_str(), Some(ws_config), false)
                .await?;
        debug!(url = %self.options.server_url, "connected, registering");

        let register = Envelope::Register(RegisterPayload {
            client_id: client_id.clone(),
        });
        ws_stream
            .send(tungstenite::Message::Text(register.encode()?.into()))
            .await?;

        let registered = tokio::time::timeout(REGISTRATION_TIMEOUT, await_registered(&mut ws_stream))
            .await
            .map_err(|_| AgentError::RegistrationTimeout)??;
        let registered_at = Instant::now();
        info!(client_id = %registered, url = %self.options.server_url, "registered with relay");

        let (write, read) = ws_stream.split();
        let (outbound, write_rx) = Outbound::channel(WRITE_BUFFER_SIZE);
        let transfers = Transfers::new(
            client_id.clone(),
            self.options.file_path.clone(),
            self.options.flow,
            outbound.clone(),
        );
        let cancel = self.cancel.child_token();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            Arc::clone(&transfers),
            outbound,
            cancel.clone(),
        ));

        Ok(AgentConnection {
            transfers,
            cancel,
            registered_at,
            _read_handle: read_handle,
            _write_handle: write_handle,
        })
    }

    /// Stays connected until [`shutdown`](Agent::shutdown), re-dialing with
    /// exponential backoff whenever the connection drops or a dial fails.
    /// The backoff restarts only after a connection that proved stable (see
    /// [`ReconnectConfig::is_stable`](crate::ReconnectConfig::is_stable)).
    ///
    /// Returns an error only for failures retrying cannot fix: an invalid
    /// client id or a registration the relay refused.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.connect().await {
                Ok(conn) => {
                    conn.closed().await;
                    if self.cancel.is_cancelled() {
                        info!("agent stopped");
                        return Ok(());
                    }
                    let uptime = conn.uptime();
                    let served = conn.transfers_served();
                    if self.options.reconnect.is_stable(uptime, served) {
                        attempt = 0;
                    }
                    warn!(uptime_ms = uptime.as_millis() as u64, served, "connection to relay lost");
                }
                Err(e @ (AgentError::InvalidClientId(_) | AgentError::Rejected(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(url = %self.options.server_url, "connect failed: {e}");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.options.reconnect.delay_for_attempt(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Reads frames until the relay acknowledges or refuses the registration.
async fn await_registered<S>(stream: &mut S) -> Result<String, AgentError>
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let tungstenite::Message::Text(text) = msg? else {
            continue;
        };
        match Envelope::decode(&text) {
            Ok(Envelope::Registered(RegisteredPayload { client_id })) => return Ok(client_id),
            Ok(Envelope::Error(ErrorPayload { message, .. })) => {
                return Err(AgentError::Rejected(message));
            }
            Ok(other) => {
                debug!(msg_type = other.msg_type().as_str(), "ignoring frame before registration");
            }
            Err(e) => warn!("dropping malformed frame: {e}"),
        }
    }
    Err(AgentError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReconnectConfig;
    use pullwire_transfer::FlowConfig;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    fn options(url: String, client_id: &str) -> AgentOptions {
        AgentOptions {
            server_url: url,
            client_id: client_id.into(),
            file_path: PathBuf::from("unused.bin"),
            flow: FlowConfig::default(),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                backoff_factor: 2.0,
            },
        }
    }

    /// Accepts one WebSocket and answers the first frame with `reply`.
    async fn fake_relay(reply: Option<Envelope>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _register = ws.next().await;
            if let Some(reply) = reply {
                ws.send(tungstenite::Message::Text(reply.encode().unwrap().into()))
                    .await
                    .unwrap();
            }
            // Hold the socket open until the agent hangs up.
            while ws.next().await.is_some() {}
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn invalid_client_id_rejected_before_dialing() {
        let agent = Agent::new(options("ws://127.0.0.1:1".into(), "../escape"));
        assert!(matches!(agent.connect().await, Err(AgentError::InvalidClientId(_))));
        assert!(matches!(agent.run().await, Err(AgentError::InvalidClientId(_))));
    }

    #[tokio::test]
    async fn registration_acknowledged() {
        let url = fake_relay(Some(Envelope::Registered(RegisteredPayload {
            client_id: "c1".into(),
        })))
        .await;
        let agent = Agent::new(options(url, "c1"));

        let conn = agent.connect().await.unwrap();
        assert!(!conn.is_closed());
        assert!(conn.active_session().is_none());
        assert_eq!(conn.transfers_served(), 0);

        agent.shutdown();
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("closes on shutdown");
    }

    #[tokio::test]
    async fn registration_refused() {
        let url = fake_relay(Some(Envelope::error(None, "invalid client id"))).await;
        let agent = Agent::new(options(url, "c1"));
        match agent.connect().await {
            Err(AgentError::Rejected(message)) => assert_eq!(message, "invalid client id"),
            other => panic!("expected rejection, got {:?}", other.err()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registration_times_out() {
        let url = fake_relay(None).await;
        let agent = Agent::new(options(url, "c1"));
        assert!(matches!(agent.connect().await, Err(AgentError::RegistrationTimeout)));
    }

    #[tokio::test]
    async fn run_returns_after_shutdown_while_retrying() {
        // Nothing listens on the port, so every dial fails.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agent = Arc::new(Agent::new(options(format!("ws://{addr}"), "c1")));
        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run stops")
            .unwrap();
        assert!(result.is_ok());
    }
}
