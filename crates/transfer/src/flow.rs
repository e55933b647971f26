//! Sender-side flow control.
//!
//! The controller reads the source one chunk at a time and only reads the
//! next chunk once the number of enqueued-but-unflushed frames is below the
//! configured window. Reading ("produce the next chunk") and flushing
//! ("the transport accepted the frame") are separate concerns joined only by
//! the [`FlushAck`] each enqueue returns.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use pullwire_protocol::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use pullwire_protocol::envelope::Envelope;
use pullwire_protocol::messages::{ChunkPayload, CompletePayload};

use crate::progress::TransferSummary;
use crate::session::{FailureReason, TransferSession};
use crate::source::ChunkSource;
use crate::TransferError;

/// A boxed future returned by [`EnvelopeSink::enqueue`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<FlushAck, TransferError>> + Send + 'a>>;

/// Ordered outbound channel of a connection.
///
/// Envelopes are transmitted in the order they are enqueued. The returned
/// [`FlushAck`] resolves once the transport has written and flushed the
/// frame.
pub trait EnvelopeSink: Send + Sync {
    fn enqueue(&self, envelope: Envelope) -> SinkFuture<'_>;
}

/// Resolves when one enqueued frame has been flushed by the transport.
#[derive(Debug)]
pub struct FlushAck {
    rx: oneshot::Receiver<Result<(), String>>,
}

/// Producer half of a [`FlushAck`], held by the transport's write pump.
#[derive(Debug)]
pub struct FlushNotifier {
    tx: oneshot::Sender<Result<(), String>>,
}

impl FlushAck {
    /// Creates a connected notifier/ack pair.
    pub fn channel() -> (FlushNotifier, FlushAck) {
        let (tx, rx) = oneshot::channel();
        (FlushNotifier { tx }, FlushAck { rx })
    }

    /// Waits for the flush. A dropped notifier counts as a closed
    /// connection.
    pub async fn flushed(self) -> Result<(), TransferError> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("frame flush failed: {e}");
                Err(TransferError::ConnectionClosed)
            }
            Err(_) => Err(TransferError::ConnectionClosed),
        }
    }
}

impl FlushNotifier {
    /// Reports the outcome of writing the frame.
    pub fn notify(self, result: Result<(), String>) {
        let _ = self.tx.send(result);
    }
}

/// Flow controller settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Maximum raw bytes per chunk (before base64).
    pub chunk_size: usize,
    /// Maximum chunk frames enqueued but not yet flushed.
    pub max_in_flight: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: 1,
        }
    }
}

impl FlowConfig {
    /// Replaces a zero chunk size with the default, caps it at
    /// [`MAX_CHUNK_SIZE`] and keeps at least one frame in flight.
    pub fn normalized(self) -> Self {
        let chunk_size = match self.chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            n => n.min(MAX_CHUNK_SIZE),
        };
        Self {
            chunk_size,
            max_in_flight: self.max_in_flight.max(1),
        }
    }
}

/// Streams a file over an [`EnvelopeSink`] as `chunk` envelopes followed by
/// a `complete` envelope.
pub struct FlowController<S> {
    sink: S,
    config: FlowConfig,
}

impl<S: EnvelopeSink> FlowController<S> {
    pub fn new(sink: S, config: FlowConfig) -> Self {
        Self {
            sink,
            config: config.normalized(),
        }
    }

    /// Returns the effective configuration.
    pub fn config(&self) -> FlowConfig {
        self.config
    }

    /// Sends the file at `path` under `session`.
    ///
    /// Source failures are reported to the peer with an `error` envelope and
    /// no `complete` is sent. A closed connection ends the transfer silently.
    /// In every case the session ends in a terminal state.
    pub async fn send_file(
        &self,
        session: &TransferSession,
        path: &Path,
    ) -> Result<TransferSummary, TransferError> {
        let session_id = session.id();

        let mut source = match ChunkSource::open(path, self.config.chunk_size).await {
            Ok(s) => s,
            Err(e) => {
                let message = match &e {
                    TransferError::FileNotFound(_) => "File not found".to_string(),
                    other => other.to_string(),
                };
                warn!(session = %session_id, path = %path.display(), "cannot open source: {e}");
                self.report_failure(session, &e, message).await;
                return Err(e);
            }
        };

        info!(
            session = %session_id,
            path = %path.display(),
            chunk_size = self.config.chunk_size,
            "streaming file"
        );

        let mut in_flight: VecDeque<FlushAck> = VecDeque::with_capacity(self.config.max_in_flight);
        let mut sequence_index: u64 = 0;

        loop {
            if in_flight.len() >= self.config.max_in_flight {
                if let Some(ack) = in_flight.pop_front() {
                    lost_on_err(session, ack.flushed().await)?;
                }
            }

            let data = match source.next_chunk().await {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    drop(source);
                    warn!(session = %session_id, seq = sequence_index, "source read failed: {e}");
                    let message = e.to_string();
                    self.report_failure(session, &e, message).await;
                    return Err(e);
                }
            };

            let len = data.len() as u64;
            let chunk = Envelope::Chunk(ChunkPayload {
                session_id: session_id.clone(),
                sequence_index,
                data,
            });
            let ack = lost_on_err(session, self.sink.enqueue(chunk).await)?;
            session.record_chunk(len)?;
            in_flight.push_back(ack);
            trace!(session = %session_id, seq = sequence_index, bytes = len, "chunk enqueued");
            sequence_index += 1;
        }

        let total_bytes = source.offset();
        drop(source);

        while let Some(ack) = in_flight.pop_front() {
            lost_on_err(session, ack.flushed().await)?;
        }

        let complete = Envelope::Complete(CompletePayload {
            session_id: session_id.clone(),
            total_chunks: sequence_index,
            total_bytes,
        });
        let ack = lost_on_err(session, self.sink.enqueue(complete).await)?;
        lost_on_err(session, ack.flushed().await)?;
        session.complete()?;

        let summary = TransferSummary {
            chunks: sequence_index,
            bytes: total_bytes,
            elapsed: session.elapsed(),
        };
        info!(
            session = %session_id,
            chunks = summary.chunks,
            bytes = summary.bytes,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "file sent"
        );
        Ok(summary)
    }

    async fn report_failure(&self, session: &TransferSession, err: &TransferError, message: String) {
        session.fail(FailureReason::from(err));
        let envelope = Envelope::error(Some(session.id().as_str()), message);
        match self.sink.enqueue(envelope).await {
            Ok(ack) => {
                let _ = ack.flushed().await;
            }
            Err(e) => debug!("could not report failure to peer: {e}"),
        }
    }
}

/// Marks the session as lost when the connection failed underneath it.
fn lost_on_err<T>(session: &TransferSession, result: Result<T, TransferError>) -> Result<T, TransferError> {
    result.inspect_err(|_| {
        session.fail(FailureReason::ConnectionLost);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use pullwire_protocol::messages::ErrorPayload;
    use tempfile::TempDir;

    use crate::session::SessionState;

    /// Records every envelope. In deferred mode the flush is acknowledged
    /// from a separate task after a few scheduler turns.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Envelope>>,
        outstanding: Arc<AtomicUsize>,
        max_outstanding: AtomicUsize,
        deferred: bool,
        close_after: Option<usize>,
    }

    impl RecordingSink {
        fn deferred() -> Self {
            Self {
                deferred: true,
                ..Default::default()
            }
        }

        fn frames(&self) -> Vec<Envelope> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl EnvelopeSink for RecordingSink {
        fn enqueue(&self, envelope: Envelope) -> SinkFuture<'_> {
            Box::pin(async move {
                let mut frames = self.frames.lock().unwrap();
                if self.close_after.is_some_and(|n| frames.len() >= n) {
                    return Err(TransferError::ConnectionClosed);
                }
                frames.push(envelope);
                drop(frames);

                let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_outstanding.fetch_max(now, Ordering::SeqCst);

                let (notifier, ack) = FlushAck::channel();
                let outstanding = Arc::clone(&self.outstanding);
                if self.deferred {
                    tokio::spawn(async move {
                        for _ in 0..3 {
                            tokio::task::yield_now().await;
                        }
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        notifier.notify(Ok(()));
                    });
                } else {
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    notifier.notify(Ok(()));
                }
                Ok(ack)
            })
        }
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(data)
            .unwrap();
        path
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn ten_mib_file_yields_160_chunks_then_complete() {
        let dir = TempDir::new().unwrap();
        let original = patterned(10 * 1024 * 1024);
        let path = write_file(dir.path(), "big.bin", &original);

        let controller = FlowController::new(RecordingSink::default(), FlowConfig::default());
        let session = TransferSession::new("s-160", "restaurant-1");
        let summary = controller.send_file(&session, &path).await.unwrap();
        assert_eq!(summary.chunks, 160);
        assert_eq!(summary.bytes, 10_485_760);
        assert_eq!(session.state(), SessionState::Completed);

        let frames = controller.sink.frames();
        assert_eq!(frames.len(), 161);

        let mut reassembled = Vec::with_capacity(original.len());
        for (i, frame) in frames[..160].iter().enumerate() {
            match frame {
                Envelope::Chunk(c) => {
                    assert_eq!(c.session_id, "s-160");
                    assert_eq!(c.sequence_index, i as u64);
                    assert!(c.data.len() <= DEFAULT_CHUNK_SIZE);
                    reassembled.extend_from_slice(&c.data);
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(reassembled, original);

        assert_eq!(
            frames[160],
            Envelope::Complete(CompletePayload {
                session_id: "s-160".into(),
                total_chunks: 160,
                total_bytes: 10_485_760,
            })
        );
    }

    #[tokio::test]
    async fn empty_file_sends_only_complete() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "empty.bin", b"");

        let controller = FlowController::new(RecordingSink::default(), FlowConfig::default());
        let session = TransferSession::new("s-0", "restaurant-1");
        controller.send_file(&session, &path).await.unwrap();

        assert_eq!(
            controller.sink.frames(),
            vec![Envelope::Complete(CompletePayload {
                session_id: "s-0".into(),
                total_chunks: 0,
                total_bytes: 0,
            })]
        );
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn missing_file_sends_error_only() {
        let dir = TempDir::new().unwrap();
        let controller = FlowController::new(RecordingSink::default(), FlowConfig::default());
        let session = TransferSession::new("s-x", "c");

        let result = controller
            .send_file(&session, &dir.path().join("missing.bin"))
            .await;
        assert!(matches!(result, Err(TransferError::FileNotFound(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            controller.sink.frames(),
            vec![Envelope::Error(ErrorPayload {
                session_id: Some("s-x".into()),
                message: "File not found".into(),
            })]
        );
    }

    #[tokio::test]
    async fn window_of_one_keeps_one_frame_outstanding() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", &patterned(64 * 1024));

        let config = FlowConfig {
            chunk_size: 1024,
            max_in_flight: 1,
        };
        let controller = FlowController::new(RecordingSink::deferred(), config);
        let session = TransferSession::new("s", "c");
        let summary = controller.send_file(&session, &path).await.unwrap();

        assert_eq!(summary.chunks, 64);
        assert_eq!(controller.sink.max_outstanding.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wider_window_is_bounded() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", &patterned(256 * 1024));

        let config = FlowConfig {
            chunk_size: 1024,
            max_in_flight: 4,
        };
        let controller = FlowController::new(RecordingSink::deferred(), config);
        let session = TransferSession::new("s", "c");
        controller.send_file(&session, &path).await.unwrap();

        let max = controller.sink.max_outstanding.load(Ordering::SeqCst);
        assert!(max <= 4, "outstanding frames exceeded window: {max}");
        assert_eq!(controller.sink.frames().len(), 257);
    }

    #[tokio::test]
    async fn closed_connection_abandons_without_complete() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", &patterned(10 * 1024));

        let sink = RecordingSink {
            close_after: Some(3),
            ..Default::default()
        };
        let config = FlowConfig {
            chunk_size: 1024,
            max_in_flight: 1,
        };
        let controller = FlowController::new(sink, config);
        let session = TransferSession::new("s", "c");

        let result = controller.send_file(&session, &path).await;
        assert!(matches!(result, Err(TransferError::ConnectionClosed)));
        assert_eq!(session.failure(), Some(FailureReason::ConnectionLost));

        let frames = controller.sink.frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| matches!(f, Envelope::Chunk(_))));
    }

    #[tokio::test]
    async fn dropped_notifier_counts_as_closed() {
        let (notifier, ack) = FlushAck::channel();
        drop(notifier);
        assert!(matches!(
            ack.flushed().await,
            Err(TransferError::ConnectionClosed)
        ));

        let (notifier, ack) = FlushAck::channel();
        notifier.notify(Err("broken pipe".into()));
        assert!(ack.flushed().await.is_err());
    }

    #[test]
    fn config_is_normalized() {
        let config = FlowConfig {
            chunk_size: 0,
            max_in_flight: 0,
        }
        .normalized();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_in_flight, 1);

        let config = FlowConfig {
            chunk_size: usize::MAX,
            max_in_flight: 2,
        }
        .normalized();
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }
}
