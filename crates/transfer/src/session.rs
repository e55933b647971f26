use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::TransferError;

/// Lifecycle of a transfer session.
///
/// `Pending -> InProgress -> Completed | Failed`, or `Pending -> Failed`
/// (and `Pending -> Completed` for an empty source). Terminal states are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SessionState {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The peer sent an `error` envelope.
    Peer { message: String },
    /// The local source could not be opened or read.
    Source { message: String },
    /// The sink could not be written.
    SinkWrite { message: String },
    /// The connection carrying the session went away.
    ConnectionLost,
    /// Another connection registered under the same client id.
    Superseded,
    /// No activity within the configured session timeout.
    TimedOut,
    SequenceGap { expected: u64, got: u64 },
    TotalsMismatch {
        reported_chunks: u64,
        reported_bytes: u64,
        actual_chunks: u64,
        actual_bytes: u64,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Peer { message } => write!(f, "peer error: {message}"),
            FailureReason::Source { message } => write!(f, "source error: {message}"),
            FailureReason::SinkWrite { message } => write!(f, "sink write error: {message}"),
            FailureReason::ConnectionLost => f.write_str("connection lost"),
            FailureReason::Superseded => f.write_str("superseded by a newer connection"),
            FailureReason::TimedOut => f.write_str("timed out"),
            FailureReason::SequenceGap { expected, got } => {
                write!(f, "sequence gap: expected {expected}, got {got}")
            }
            FailureReason::TotalsMismatch {
                reported_chunks,
                reported_bytes,
                actual_chunks,
                actual_bytes,
            } => write!(
                f,
                "totals mismatch: reported {reported_chunks}/{reported_bytes}, \
                 received {actual_chunks}/{actual_bytes}"
            ),
        }
    }
}

impl From<&TransferError> for FailureReason {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::SequenceGap { expected, got } => FailureReason::SequenceGap {
                expected: *expected,
                got: *got,
            },
            TransferError::TotalsMismatch {
                reported_chunks,
                reported_bytes,
                actual_chunks,
                actual_bytes,
            } => FailureReason::TotalsMismatch {
                reported_chunks: *reported_chunks,
                reported_bytes: *reported_bytes,
                actual_chunks: *actual_chunks,
                actual_bytes: *actual_bytes,
            },
            TransferError::SinkWrite(e) => FailureReason::SinkWrite {
                message: e.to_string(),
            },
            TransferError::FileNotFound(_) | TransferError::SourceRead(_) => {
                FailureReason::Source {
                    message: err.to_string(),
                }
            }
            TransferError::ConnectionClosed => FailureReason::ConnectionLost,
            other => FailureReason::Source {
                message: other.to_string(),
            },
        }
    }
}

/// Point-in-time view of a session, suitable for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub client_id: String,
    pub state: SessionState,
    pub chunks: u64,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
}

/// Tracks one file transfer end-to-end (thread-safe).
///
/// A session is never reused: once it reaches a terminal state every
/// further transition is rejected.
pub struct TransferSession {
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    id: String,
    client_id: String,
    state: SessionState,
    chunks: u64,
    bytes: u64,
    created_at: DateTime<Utc>,
    started_at: Option<Instant>,
    last_activity: Instant,
    finished_at: Option<Instant>,
    failure: Option<FailureReason>,
}

impl TransferSession {
    /// Creates a new pending session owned by `client_id`.
    pub fn new(id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(SessionInner {
                id: id.into(),
                client_id: client_id.into(),
                state: SessionState::Pending,
                chunks: 0,
                bytes: 0,
                created_at: Utc::now(),
                started_at: None,
                last_activity: Instant::now(),
                finished_at: None,
                failure: None,
            }),
        }
    }

    /// Records one chunk of `bytes`. The first chunk moves the session to
    /// `InProgress`.
    pub fn record_chunk(&self, bytes: u64) -> Result<(), TransferError> {
        let mut s = self.write();
        let now = Instant::now();
        match s.state {
            SessionState::Pending => {
                s.state = SessionState::InProgress;
                s.started_at = Some(now);
            }
            SessionState::InProgress => {}
            from => {
                return Err(TransferError::InvalidTransition {
                    from,
                    to: SessionState::InProgress,
                });
            }
        }
        s.chunks += 1;
        s.bytes += bytes;
        s.last_activity = now;
        Ok(())
    }

    /// Marks the session as completed.
    pub fn complete(&self) -> Result<(), TransferError> {
        let mut s = self.write();
        if s.state.is_terminal() {
            return Err(TransferError::InvalidTransition {
                from: s.state,
                to: SessionState::Completed,
            });
        }
        let now = Instant::now();
        s.state = SessionState::Completed;
        s.started_at.get_or_insert(now);
        s.finished_at = Some(now);
        s.last_activity = now;
        Ok(())
    }

    /// Marks the session as failed.
    ///
    /// Returns `false` (and changes nothing) if the session had already
    /// reached a terminal state.
    pub fn fail(&self, reason: FailureReason) -> bool {
        let mut s = self.write();
        if s.state.is_terminal() {
            return false;
        }
        let now = Instant::now();
        s.state = SessionState::Failed;
        s.failure = Some(reason);
        s.finished_at = Some(now);
        s.last_activity = now;
        true
    }

    /// Returns `true` if the session is pending or in progress.
    pub fn is_active(&self) -> bool {
        !self.read().state.is_terminal()
    }

    /// Returns the session ID.
    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    /// Returns the owning client ID.
    pub fn client_id(&self) -> String {
        self.read().client_id.clone()
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.read().state
    }

    /// Returns the failure reason, if the session failed.
    pub fn failure(&self) -> Option<FailureReason> {
        self.read().failure.clone()
    }

    /// Returns the number of chunks recorded so far.
    pub fn chunks(&self) -> u64 {
        self.read().chunks
    }

    /// Returns the number of bytes recorded so far.
    pub fn bytes(&self) -> u64 {
        self.read().bytes
    }

    /// Time since the last recorded activity, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.read().last_activity)
    }

    /// Time between the first chunk (or creation) and completion, or until
    /// now for an unfinished session.
    pub fn elapsed(&self) -> Duration {
        let s = self.read();
        let Some(start) = s.started_at else {
            return Duration::ZERO;
        };
        s.finished_at.unwrap_or_else(Instant::now).duration_since(start)
    }

    /// Returns a serializable snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.read();
        SessionSnapshot {
            session_id: s.id.clone(),
            client_id: s.client_id.clone(),
            state: s.state,
            chunks: s.chunks,
            bytes: s.bytes,
            created_at: s.created_at,
            error: s.failure.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.read();
        f.debug_struct("TransferSession")
            .field("id", &s.id)
            .field("client_id", &s.client_id)
            .field("state", &s.state)
            .field("chunks", &s.chunks)
            .field("bytes", &s.bytes)
            .finish()
    }
}
