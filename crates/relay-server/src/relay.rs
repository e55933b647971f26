//! Relay core: download orchestration and receiver-side session handling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pullwire_protocol::envelope::Envelope;
use pullwire_protocol::messages::{
    ChunkPayload, CompletePayload, DownloadRequestPayload, ErrorPayload,
};
use pullwire_transfer::{
    Assembler, ChunkProgress, FailureReason, SessionSnapshot, TransferError, TransferSession,
    TransferSummary, validate_identifier,
};

use crate::RequestError;
use crate::connection::ConnectionHandle;
use crate::handler::{Handler, HandlerFuture};
use crate::registry::{ActiveDownload, Registry};
use crate::sessions::SessionBook;

/// Relay settings that affect session handling.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Directory receiving one sink file per session.
    pub downloads_dir: PathBuf,
    /// Sessions without activity for this long are failed.
    pub session_timeout: Duration,
    /// Keep the partial sink file of a failed session.
    pub keep_partial_files: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            session_timeout: Duration::from_secs(120),
            keep_partial_files: true,
        }
    }
}

/// Identifies a download that was successfully initiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub client_id: String,
    pub session_id: String,
}

/// The relay: registry of connected agents plus their download sessions.
pub struct RelayServer {
    pub(crate) config: RelayConfig,
    pub(crate) registry: Registry,
    pub(crate) sessions: SessionBook,
    pub(crate) cancel: CancellationToken,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            sessions: SessionBook::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stops the accept loop, the sweeper and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Asks `client_id` to send its file.
    ///
    /// Returns as soon as the request is queued; the transfer itself is
    /// observed through [`session_status`](Self::session_status).
    pub async fn request_download(&self, client_id: &str) -> Result<SessionHandle, RequestError> {
        let entry = self
            .registry
            .lookup(client_id)
            .ok_or_else(|| RequestError::ClientNotConnected(client_id.to_string()))?;

        let mut slot = entry.download().await;
        if let Some(active) = slot.as_ref().filter(|a| a.session.is_active()) {
            return Err(RequestError::DownloadInProgress {
                client_id: client_id.to_string(),
                session_id: active.session.id(),
            });
        }

        let session_id = new_session_id();
        let request = Envelope::DownloadRequest(DownloadRequestPayload {
            session_id: session_id.clone(),
        });
        if entry.handle().sender().send_envelope(&request).is_err() {
            return Err(RequestError::ClientNotConnected(client_id.to_string()));
        }

        let session = Arc::new(TransferSession::new(session_id.clone(), client_id));
        self.sessions.insert(Arc::clone(&session));
        *slot = Some(ActiveDownload {
            session,
            assembler: None,
        });
        info!(client = %client_id, session = %session_id, "download requested");

        Ok(SessionHandle {
            client_id: client_id.to_string(),
            session_id,
        })
    }

    /// Status of an active or recently finished session.
    pub fn session_status(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(session_id)
    }

    /// Fails every session idle for longer than the configured timeout,
    /// measured at `now`. Returns how many were expired.
    pub async fn expire_idle(&self, now: Instant) -> usize {
        let mut expired = 0;
        for entry in self.registry.list() {
            let mut slot = entry.download().await;
            let idle = slot
                .as_ref()
                .is_some_and(|a| a.session.idle_for(now) > self.config.session_timeout);
            if !idle {
                continue;
            }
            if let Some(download) = slot.take() {
                self.abandon(download, FailureReason::TimedOut, Some(entry.handle()))
                    .await;
                expired += 1;
            }
        }
        expired
    }

    async fn on_register(&self, conn: ConnectionHandle, client_id: &str) {
        if let Err(e) = validate_identifier(client_id) {
            warn!(conn = conn.id(), "rejecting registration: {e}");
            let reply = Envelope::error(None, format!("invalid client id: {e}"));
            if conn.sender().send_envelope(&reply).is_err() {
                debug!(conn = conn.id(), "connection closed before rejection was sent");
            }
            return;
        }

        for old in self.registry.register(conn, client_id) {
            let download = old.download().await.take();
            if let Some(download) = download {
                self.abandon(download, FailureReason::Superseded, Some(old.handle()))
                    .await;
            }
        }
    }

    async fn on_chunk(&self, conn: &ConnectionHandle, chunk: ChunkPayload) {
        let Some(entry) = self.registry.entry_for(conn) else {
            debug!(conn = conn.id(), session = %chunk.session_id, "chunk from unregistered connection");
            return;
        };
        let mut slot = entry.download().await;
        let Some(active) = slot.as_mut().filter(|a| a.session.id() == chunk.session_id) else {
            debug!(client = %entry.client_id(), session = %chunk.session_id, "discarding chunk for unknown session");
            return;
        };

        let session_id = chunk.session_id.clone();
        match self.append_chunk(entry.client_id(), active, chunk).await {
            Ok(progress) => {
                if progress.report {
                    info!(
                        client = %entry.client_id(),
                        session = %session_id,
                        chunks = progress.chunks,
                        bytes = progress.bytes,
                        mib_per_sec = progress.bytes_per_second / (1024.0 * 1024.0),
                        "download progress"
                    );
                }
            }
            Err(e) => {
                if let Some(download) = slot.take() {
                    self.abandon(download, FailureReason::from(&e), Some(conn)).await;
                }
            }
        }
    }

    async fn append_chunk(
        &self,
        client_id: &str,
        active: &mut ActiveDownload,
        chunk: ChunkPayload,
    ) -> Result<ChunkProgress, TransferError> {
        let assembler = match active.assembler.take() {
            Some(a) => a,
            None => Assembler::create(&self.config.downloads_dir, client_id, &chunk.session_id).await?,
        };
        let assembler = active.assembler.insert(assembler);
        let progress = assembler.append(chunk.sequence_index, &chunk.data).await?;
        active.session.record_chunk(chunk.data.len() as u64)?;
        Ok(progress)
    }

    async fn on_complete(&self, conn: &ConnectionHandle, complete: CompletePayload) {
        let Some(entry) = self.registry.entry_for(conn) else {
            debug!(conn = conn.id(), session = %complete.session_id, "complete from unregistered connection");
            return;
        };
        // Held until the session is terminal.
        let mut slot = entry.download().await;
        let Some(active) = slot
            .as_mut()
            .filter(|a| a.session.id() == complete.session_id)
        else {
            debug!(client = %entry.client_id(), session = %complete.session_id, "discarding complete for unknown session");
            return;
        };

        match self.finish_download(entry.client_id(), active, &complete).await {
            Ok((summary, path)) => {
                info!(
                    client = %entry.client_id(),
                    session = %complete.session_id,
                    chunks = summary.chunks,
                    bytes = summary.bytes,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    mib_per_sec = summary.mib_per_second(),
                    path = %path.display(),
                    "download complete"
                );
                *slot = None;
                self.sessions.retire(&complete.session_id);
            }
            Err(e) => {
                if let Some(download) = slot.take() {
                    self.abandon(download, FailureReason::from(&e), Some(conn)).await;
                }
            }
        }
    }

    async fn finish_download(
        &self,
        client_id: &str,
        active: &mut ActiveDownload,
        complete: &CompletePayload,
    ) -> Result<(TransferSummary, PathBuf), TransferError> {
        let assembler = match active.assembler.take() {
            Some(a) => a,
            // Empty source: no chunk ever opened the sink.
            None => Assembler::create(&self.config.downloads_dir, client_id, &complete.session_id).await?,
        };
        let assembler = active.assembler.insert(assembler);
        let summary = assembler
            .finish(complete.total_chunks, complete.total_bytes)
            .await?;
        active.session.complete()?;
        Ok((summary, assembler.path().to_path_buf()))
    }

    async fn on_peer_error(&self, conn: &ConnectionHandle, error: ErrorPayload) {
        let entry = self.registry.entry_for(conn);
        let client = entry.as_ref().map(|e| e.client_id().to_string()).unwrap_or_default();

        let Some(entry) = entry else {
            warn!(conn = conn.id(), "error from unregistered connection: {}", error.message);
            return;
        };
        let Some(session_id) = error.session_id else {
            warn!(%client, "agent reported error: {}", error.message);
            return;
        };

        let mut slot = entry.download().await;
        if !slot.as_ref().is_some_and(|a| a.session.id() == session_id) {
            debug!(%client, session = %session_id, "discarding error for unknown session: {}", error.message);
            return;
        }
        if let Some(download) = slot.take() {
            let reason = FailureReason::Peer {
                message: error.message,
            };
            self.abandon(download, reason, None).await;
        }
    }

    async fn on_disconnect(&self, conn: &ConnectionHandle) {
        let Some(entry) = self.registry.unregister(conn) else {
            return;
        };
        info!(client = %entry.client_id(), conn = conn.id(), "client unregistered");
        let download = entry.download().await.take();
        if let Some(download) = download {
            self.abandon(download, FailureReason::ConnectionLost, None).await;
        }
    }

    /// Fails a download, releases its sink and moves it to the history.
    ///
    /// When the relay itself ends the session, `notify` is the agent's
    /// connection and receives an `ERROR` so it stops streaming.
    async fn abandon(
        &self,
        mut download: ActiveDownload,
        reason: FailureReason,
        notify: Option<&ConnectionHandle>,
    ) {
        let session = Arc::clone(&download.session);
        if session.fail(reason.clone()) {
            warn!(
                client = %session.client_id(),
                session = %session.id(),
                chunks = session.chunks(),
                bytes = session.bytes(),
                "download failed: {reason}"
            );
            if let Some(conn) = notify {
                let error = Envelope::error(Some(session.id().as_str()), reason.to_string());
                if conn.sender().send_envelope(&error).is_err() {
                    debug!(conn = conn.id(), session = %session.id(), "agent gone before failure notice");
                }
            }
        }
        if let Some(assembler) = download.assembler.take() {
            assembler.discard(self.config.keep_partial_files).await;
        }
        self.sessions.retire(&session.id());
    }
}

impl Handler for RelayServer {
    fn on_envelope(&self, conn: ConnectionHandle, envelope: Envelope) -> HandlerFuture<'_> {
        Box::pin(async move {
            match envelope {
                Envelope::Register(p) => self.on_register(conn, &p.client_id).await,
                Envelope::Chunk(p) => self.on_chunk(&conn, p).await,
                Envelope::Complete(p) => self.on_complete(&conn, p).await,
                Envelope::Error(p) => self.on_peer_error(&conn, p).await,
                other @ (Envelope::Registered(_) | Envelope::DownloadRequest(_)) => {
                    warn!(conn = conn.id(), msg_type = %other.msg_type(), "unexpected message from agent");
                }
            }
        })
    }

    fn on_disconnected(&self, conn: ConnectionHandle) -> HandlerFuture<'_> {
        Box::pin(async move { self.on_disconnect(&conn).await })
    }
}

/// `{unix millis}-{8 hex chars}`: unique in practice, not guaranteed.
fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}
