//! Administrative view of the relay and its HTTP exposure.
//!
//! | Method | Endpoint | Description |
//! |--------|----------|-------------|
//! | GET | /api/clients | Connected clients, oldest first |
//! | POST | /api/clients/{id}/download | Initiate a download |
//! | GET | /api/sessions/{id} | Status of a session |
//! | GET | /api/health | Connected client count |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;

use pullwire_transfer::SessionSnapshot;

use crate::relay::RelayServer;
use crate::{RequestError, ServerError};

/// One connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub has_active_download: bool,
}

/// Result of a successfully initiated download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTicket {
    pub client_id: String,
    pub session_id: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub connected_clients: usize,
}

impl RelayServer {
    /// Connected clients ordered by registration time.
    pub async fn list_clients(&self) -> Vec<ClientSummary> {
        let mut clients = Vec::new();
        for entry in self.registry.list() {
            let has_active_download = entry
                .download()
                .await
                .as_ref()
                .is_some_and(|a| a.session.is_active());
            clients.push(ClientSummary {
                id: entry.client_id().to_string(),
                connected_at: entry.registered_at(),
                has_active_download,
            });
        }
        clients
    }

    /// Initiates a download and reports it as `initiated`.
    pub async fn trigger_download(&self, client_id: &str) -> Result<DownloadTicket, RequestError> {
        let handle = self.request_download(client_id).await?;
        Ok(DownloadTicket {
            client_id: handle.client_id,
            session_id: handle.session_id,
            status: "initiated",
        })
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected_clients: self.registry.len(),
        }
    }
}

/// JSON error body of the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::ClientNotConnected(_) => Self::not_found(err.to_string()),
            RequestError::DownloadInProgress { .. } => Self::conflict(err.to_string()),
        }
    }
}

/// Builds the admin router.
pub fn router(relay: Arc<RelayServer>) -> Router {
    Router::new()
        .route("/api/clients", get(list_clients))
        .route("/api/clients/{id}/download", post(trigger_download))
        .route("/api/sessions/{id}", get(session_status))
        .route("/api/health", get(health))
        .with_state(relay)
}

/// Serves the admin API on `listener` until the relay shuts down.
pub async fn serve_admin(relay: Arc<RelayServer>, listener: TcpListener) -> Result<(), ServerError> {
    let cancel = relay.cancel.clone();
    tracing::info!("admin API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn list_clients(State(relay): State<Arc<RelayServer>>) -> Json<Vec<ClientSummary>> {
    Json(relay.list_clients().await)
}

async fn trigger_download(
    State(relay): State<Arc<RelayServer>>,
    Path(id): Path<String>,
) -> Result<Json<DownloadTicket>, ApiError> {
    Ok(Json(relay.trigger_download(&id).await?))
}

async fn session_status(
    State(relay): State<Arc<RelayServer>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    relay
        .session_status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("session not found: {id}")))
}

async fn health(State(relay): State<Arc<RelayServer>>) -> Json<HealthSnapshot> {
    Json(relay.health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Sender};
    use crate::handler::Handler;
    use crate::relay::RelayConfig;
    use axum::body::Body;
    use axum::http::Request;
    use pullwire_protocol::envelope::Envelope;
    use pullwire_protocol::messages::RegisterPayload;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tower::ServiceExt;

    async fn register(relay: &RelayServer, id: &str) -> (ConnectionHandle, mpsc::Receiver<WsMessage>) {
        let (sender, rx) = Sender::channel(16);
        let conn = ConnectionHandle::new("127.0.0.1:1", sender);
        relay
            .on_envelope(
                conn.clone(),
                Envelope::Register(RegisterPayload {
                    client_id: id.into(),
                }),
            )
            .await;
        (conn, rx)
    }

    async fn call(relay: &Arc<RelayServer>, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(relay)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn relay(dir: &TempDir) -> Arc<RelayServer> {
        RelayServer::new(RelayConfig {
            downloads_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn clients_listed_in_registration_order() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);
        let _a = register(&relay, "restaurant-2").await;
        let _b = register(&relay, "restaurant-1").await;
        relay.request_download("restaurant-1").await.unwrap();

        let clients = relay.list_clients().await;
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].id, "restaurant-2");
        assert_eq!(clients[1].id, "restaurant-1");
        assert!(clients[0].connected_at <= clients[1].connected_at);
        assert!(!clients[0].has_active_download);
        assert!(clients[1].has_active_download);

        assert_eq!(relay.health().connected_clients, 2);
    }

    #[tokio::test]
    async fn trigger_reports_initiated() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);
        let _conn = register(&relay, "c1").await;

        let ticket = relay.trigger_download("c1").await.unwrap();
        assert_eq!(ticket.client_id, "c1");
        assert_eq!(ticket.status, "initiated");
        assert!(relay.session_status(&ticket.session_id).is_some());
    }

    #[tokio::test]
    async fn http_routes() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);
        let _conn = register(&relay, "c1").await;

        let (status, body) = call(&relay, "GET", "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connectedClients"], 1);

        let (status, body) = call(&relay, "GET", "/api/clients").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "c1");
        assert_eq!(body[0]["hasActiveDownload"], false);
        assert!(body[0]["connectedAt"].is_string());

        let (status, body) = call(&relay, "POST", "/api/clients/c1/download").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "initiated");
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let (status, _) = call(&relay, "POST", "/api/clients/c1/download").await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&relay, "GET", &format!("/api/sessions/{session_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "PENDING");
        assert_eq!(body["clientId"], "c1");

        let (status, body) = call(&relay, "POST", "/api/clients/ghost/download").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("ghost"));

        let (status, _) = call(&relay, "GET", "/api/sessions/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
