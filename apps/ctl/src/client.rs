//! Admin API client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Errors from the admin client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message} ({status})")]
    Api { status: u16, message: String },

    #[error("client {client_id} did not connect within {waited:?}")]
    WaitTimeout { client_id: String, waited: Duration },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub has_active_download: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub client_id: String,
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    pub state: String,
    pub chunks: u64,
    pub bytes: u64,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Thin wrapper over the relay's admin HTTP API.
pub struct AdminClient {
    http: reqwest::Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn list_clients(&self) -> Result<Vec<Client>, Error> {
        let resp = self.http.get(self.url("/api/clients")).send().await?;
        decode(resp).await
    }

    pub async fn trigger(&self, client_id: &str) -> Result<Ticket, Error> {
        let resp = self
            .http
            .post(self.url(&format!("/api/clients/{}/download", segment(client_id))))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, Error> {
        let resp = self
            .http
            .get(self.url(&format!("/api/sessions/{}", segment(session_id))))
            .send()
            .await?;
        decode(resp).await
    }

    /// Polls the client list until `client_id` shows up.
    pub async fn wait_for_client(
        &self,
        client_id: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.list_clients().await?.iter().any(|c| c.id == client_id) {
                return Ok(());
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Err(Error::WaitTimeout {
                    client_id: client_id.to_string(),
                    waited: timeout,
                });
            }
            tracing::debug!(client = %client_id, "client not connected yet");
            tokio::time::sleep(poll).await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Escapes an id for use as one URL path segment.
fn segment(id: &str) -> String {
    utf8_percent_encode(id, NON_ALPHANUMERIC).to_string()
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);
        return Err(Error::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullwire_protocol::envelope::Envelope;
    use pullwire_protocol::messages::RegisterPayload;
    use pullwire_relay_server::{ConnectionHandle, Handler, RelayConfig, RelayServer, Sender, serve_admin};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn start(dir: &TempDir) -> (Arc<RelayServer>, AdminClient) {
        let relay = RelayServer::new(RelayConfig {
            downloads_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_admin(Arc::clone(&relay), listener));
        let client = AdminClient::new(&format!("http://{addr}/")).unwrap();
        (relay, client)
    }

    async fn register(relay: &RelayServer, id: &str) -> impl Sized {
        let (sender, rx) = Sender::channel(16);
        let conn = ConnectionHandle::new("127.0.0.1:1", sender);
        relay
            .on_envelope(
                conn,
                Envelope::Register(RegisterPayload {
                    client_id: id.into(),
                }),
            )
            .await;
        rx
    }

    #[tokio::test]
    async fn list_and_trigger() {
        let dir = TempDir::new().unwrap();
        let (relay, client) = start(&dir).await;
        let _rx = register(&relay, "restaurant-1").await;

        let clients = client.list_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, "restaurant-1");
        assert!(!clients[0].has_active_download);

        let ticket = client.trigger("restaurant-1").await.unwrap();
        assert_eq!(ticket.status, "initiated");

        let session = client.session(&ticket.session_id).await.unwrap();
        assert_eq!(session.state, "PENDING");
        assert_eq!(session.client_id, "restaurant-1");

        match client.trigger("restaurant-1").await {
            Err(Error::Api { status, .. }) => assert_eq!(status, 409),
            other => panic!("expected conflict, got {other:?}"),
        }
        relay.shutdown();
    }

    #[tokio::test]
    async fn unknown_client_reports_message() {
        let dir = TempDir::new().unwrap();
        let (relay, client) = start(&dir).await;
        match client.trigger("ghost").await {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 404);
                assert!(message.contains("ghost"));
            }
            other => panic!("expected not found, got {other:?}"),
        }
        relay.shutdown();
    }

    #[test]
    fn ids_are_escaped_as_single_segment() {
        assert_eq!(segment("restaurant1"), "restaurant1");
        assert_eq!(segment("a#b c/d?"), "a%23b%20c%2Fd%3F");
    }

    #[tokio::test]
    async fn reserved_characters_reach_the_relay_intact() {
        let dir = TempDir::new().unwrap();
        let (relay, client) = start(&dir).await;

        for id in ["a#b", "two words", "x?y=1"] {
            match client.trigger(id).await {
                Err(Error::Api { status, message }) => {
                    assert_eq!(status, 404);
                    assert_eq!(message, format!("client not connected: {id}"));
                }
                other => panic!("expected not found for {id:?}, got {other:?}"),
            }
        }
        match client.session("../../api/health").await {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "session not found: ../../api/health");
            }
            other => panic!("expected not found, got {other:?}"),
        }
        relay.shutdown();
    }

    #[tokio::test]
    async fn wait_for_client_times_out() {
        let dir = TempDir::new().unwrap();
        let (relay, client) = start(&dir).await;
        let result = client
            .wait_for_client("late", Duration::from_millis(20), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::WaitTimeout { .. })));
        relay.shutdown();
    }

    #[tokio::test]
    async fn wait_for_client_sees_late_registration() {
        let dir = TempDir::new().unwrap();
        let (relay, client) = start(&dir).await;

        let late = Arc::clone(&relay);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let rx = register(&late, "late").await;
            // Keep the channel open for the rest of the test.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(rx);
        });

        client
            .wait_for_client("late", Duration::from_millis(20), Duration::from_secs(3))
            .await
            .unwrap();
        relay.shutdown();
    }
}
