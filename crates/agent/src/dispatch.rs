//! Handles relay requests on one agent connection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pullwire_protocol::envelope::Envelope;
use pullwire_protocol::messages::{DownloadRequestPayload, ErrorPayload};
use pullwire_transfer::{EnvelopeSink, FailureReason, FlowConfig, FlowController, TransferSession};

use crate::outbound::Outbound;

/// The session being streamed and the switch that stops its task.
struct Running {
    session: Arc<TransferSession>,
    stop: CancellationToken,
}

/// Transfer state of one connection.
///
/// At most one session streams at a time; overlapping requests are answered
/// with an `error` envelope and otherwise ignored. An `error` from the relay
/// naming the running session stops it and frees the slot.
pub(crate) struct Transfers {
    client_id: String,
    file_path: PathBuf,
    flow: FlowConfig,
    outbound: Outbound,
    active: Mutex<Option<Running>>,
    served: AtomicU64,
}

impl Transfers {
    pub(crate) fn new(client_id: String, file_path: PathBuf, flow: FlowConfig, outbound: Outbound) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            file_path,
            flow,
            outbound,
            active: Mutex::new(None),
            served: AtomicU64::new(0),
        })
    }

    /// Routes one decoded envelope from the relay.
    pub(crate) async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::DownloadRequest(DownloadRequestPayload { session_id }) => {
                self.start_download(session_id).await;
            }
            Envelope::Error(payload) => self.on_relay_error(payload),
            other => {
                warn!(msg_type = other.msg_type().as_str(), "unexpected message from relay");
            }
        }
    }

    /// Returns the session currently streaming, if any.
    pub(crate) fn active(&self) -> Option<Arc<TransferSession>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| &r.session)
            .filter(|s| s.is_active())
            .cloned()
    }

    /// Number of sessions streamed to completion on this connection.
    pub(crate) fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// The relay gave up on a session. If it is the one streaming, stop it
    /// right away so the next request finds the slot free.
    fn on_relay_error(&self, ErrorPayload { session_id, message }: ErrorPayload) {
        let Some(session_id) = session_id else {
            warn!("relay reported error: {message}");
            return;
        };

        let stopped = {
            let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let current = slot
                .as_ref()
                .is_some_and(|r| r.session.id() == session_id);
            if current { slot.take() } else { None }
        };
        let Some(Running { session, stop }) = stopped else {
            debug!(session = %session_id, "relay error for a session not streaming: {message}");
            return;
        };

        stop.cancel();
        session.fail(FailureReason::Peer {
            message: message.clone(),
        });
        warn!(
            session = %session_id,
            chunks = session.chunks(),
            bytes = session.bytes(),
            "relay ended download: {message}"
        );
    }

    async fn start_download(self: &Arc<Self>, session_id: String) {
        let claimed = {
            let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let current = slot
                .as_ref()
                .filter(|r| r.session.is_active())
                .map(|r| r.session.id());
            match current {
                Some(current) => Err(current),
                None => {
                    let session = Arc::new(TransferSession::new(session_id.clone(), self.client_id.clone()));
                    let stop = CancellationToken::new();
                    *slot = Some(Running {
                        session: Arc::clone(&session),
                        stop: stop.clone(),
                    });
                    Ok((session, stop))
                }
            }
        };

        let (session, stop) = match claimed {
            Ok(claimed) => claimed,
            Err(current) => {
                let busy = format!("session {current} already in progress");
                warn!(session = %session_id, "{busy}, rejecting request");
                let reply = Envelope::error(Some(session_id.as_str()), busy);
                if let Err(e) = self.outbound.enqueue(reply).await {
                    warn!(session = %session_id, "failed to send rejection: {e}");
                }
                return;
            }
        };

        info!(session = %session.id(), path = %self.file_path.display(), "download requested");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let controller = FlowController::new(this.outbound.clone(), this.flow);
            let result = tokio::select! {
                _ = stop.cancelled() => return,
                result = controller.send_file(&session, &this.file_path) => result,
            };
            match result {
                Ok(summary) => {
                    this.served.fetch_add(1, Ordering::Relaxed);
                    info!(
                        session = %session.id(),
                        chunks = summary.chunks,
                        bytes = summary.bytes,
                        mib_per_sec = summary.mib_per_second(),
                        "download finished"
                    );
                }
                Err(e) => warn!(session = %session.id(), "download failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundFrame;
    use pullwire_protocol::messages::{ChunkPayload, CompletePayload, ErrorPayload};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite;

    fn decode(frame: &OutboundFrame) -> Envelope {
        let tungstenite::Message::Text(text) = &frame.message else {
            panic!("expected text frame");
        };
        Envelope::decode(text).unwrap()
    }

    /// Acknowledges every frame as written and forwards its envelope.
    fn auto_flush(mut rx: mpsc::Receiver<OutboundFrame>) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, out) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let envelope = decode(&frame);
                if let Some(n) = frame.flushed {
                    n.notify(Ok(()));
                }
                if tx.send(envelope).is_err() {
                    break;
                }
            }
        });
        out
    }

    fn request(id: &str) -> Envelope {
        Envelope::DownloadRequest(DownloadRequestPayload {
            session_id: id.into(),
        })
    }

    #[tokio::test]
    async fn download_request_streams_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 10]).unwrap();

        let (outbound, rx) = Outbound::channel(16);
        let mut sent = auto_flush(rx);
        let transfers = Transfers::new(
            "c1".into(),
            file.path().to_path_buf(),
            FlowConfig {
                chunk_size: 4,
                max_in_flight: 1,
            },
            outbound,
        );

        transfers.dispatch(request("s1")).await;

        let mut chunks = Vec::new();
        loop {
            match sent.recv().await.unwrap() {
                Envelope::Chunk(ChunkPayload { sequence_index, data, .. }) => {
                    chunks.push((sequence_index, data.len()));
                }
                Envelope::Complete(CompletePayload {
                    session_id,
                    total_chunks,
                    total_bytes,
                }) => {
                    assert_eq!(session_id, "s1");
                    assert_eq!(total_chunks, 3);
                    assert_eq!(total_bytes, 10);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(chunks, vec![(0, 4), (1, 4), (2, 2)]);
    }

    #[tokio::test]
    async fn overlapping_request_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 64]).unwrap();

        // Nothing acknowledges frames, so the first session stays active.
        let (outbound, mut rx) = Outbound::channel(16);
        let transfers = Transfers::new(
            "c1".into(),
            file.path().to_path_buf(),
            FlowConfig {
                chunk_size: 8,
                max_in_flight: 1,
            },
            outbound,
        );

        transfers.dispatch(request("s1")).await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(decode(&first), Envelope::Chunk(_)));
        assert_eq!(transfers.active().unwrap().id(), "s1");

        transfers.dispatch(request("s2")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(
            decode(&reply),
            Envelope::Error(ErrorPayload {
                session_id: Some("s2".into()),
                message: "session s1 already in progress".into(),
            })
        );
        assert_eq!(transfers.active().unwrap().id(), "s1");
    }

    fn blocked(file: &NamedTempFile) -> (Arc<Transfers>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = Outbound::channel(16);
        let transfers = Transfers::new(
            "c1".into(),
            file.path().to_path_buf(),
            FlowConfig {
                chunk_size: 8,
                max_in_flight: 1,
            },
            outbound,
        );
        (transfers, rx)
    }

    #[tokio::test]
    async fn relay_error_stops_running_session() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 64]).unwrap();
        let (transfers, mut rx) = blocked(&file);

        transfers.dispatch(request("s1")).await;
        assert!(matches!(decode(&rx.recv().await.unwrap()), Envelope::Chunk(_)));
        let s1 = transfers.active().unwrap();

        transfers
            .dispatch(Envelope::error(Some("s1"), "timed out"))
            .await;
        assert!(transfers.active().is_none());
        assert_eq!(
            s1.failure(),
            Some(FailureReason::Peer {
                message: "timed out".into()
            })
        );

        // The slot is free: a new request streams instead of being refused.
        transfers.dispatch(request("s2")).await;
        match decode(&rx.recv().await.unwrap()) {
            Envelope::Chunk(chunk) => {
                assert_eq!(chunk.session_id, "s2");
                assert_eq!(chunk.sequence_index, 0);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
        assert_eq!(transfers.active().unwrap().id(), "s2");
    }

    #[tokio::test]
    async fn relay_error_for_other_session_leaves_transfer_running() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 64]).unwrap();
        let (transfers, mut rx) = blocked(&file);

        transfers.dispatch(request("s1")).await;
        rx.recv().await.unwrap();

        transfers
            .dispatch(Envelope::error(Some("s0"), "timed out"))
            .await;
        transfers.dispatch(Envelope::error(None, "general")).await;
        assert_eq!(transfers.active().unwrap().id(), "s1");
        assert_eq!(transfers.served(), 0);
    }

    #[tokio::test]
    async fn completed_download_counts_as_served() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hi").unwrap();
        let (outbound, rx) = Outbound::channel(16);
        let mut sent = auto_flush(rx);
        let transfers = Transfers::new("c1".into(), file.path().to_path_buf(), FlowConfig::default(), outbound);

        transfers.dispatch(request("s1")).await;
        while !matches!(sent.recv().await.unwrap(), Envelope::Complete(_)) {}
        for _ in 0..100 {
            if transfers.served() == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("completed download was not counted");
    }

    #[tokio::test]
    async fn missing_file_reports_error() {
        let (outbound, rx) = Outbound::channel(16);
        let mut sent = auto_flush(rx);
        let transfers = Transfers::new(
            "c1".into(),
            PathBuf::from("/definitely/not/here.bin"),
            FlowConfig::default(),
            outbound,
        );

        transfers.dispatch(request("s9")).await;
        assert_eq!(
            sent.recv().await.unwrap(),
            Envelope::error(Some("s9"), "File not found")
        );
    }
}
