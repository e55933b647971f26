//! Chunked transfer sessions with flow control and in-order reassembly.
//!
//! The sending half ([`FlowController`]) lives on the agent; the receiving
//! half ([`Assembler`]) lives on the relay. Both track their progress in a
//! [`TransferSession`].

mod assembler;
mod flow;
mod progress;
mod session;
mod source;
mod validation;

pub use assembler::{Assembler, ChunkProgress, SINK_SUFFIX};
pub use flow::{EnvelopeSink, FlowConfig, FlowController, FlushAck, FlushNotifier, SinkFuture};
pub use progress::{SpeedCalculator, TransferSummary};
pub use session::{FailureReason, SessionSnapshot, SessionState, TransferSession};
pub use source::ChunkSource;
pub use validation::{MAX_IDENTIFIER_LEN, validate_identifier};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("source read error: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("sink write error: {0}")]
    SinkWrite(#[source] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("sequence gap: expected chunk {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error(
        "totals mismatch: reported {reported_chunks} chunks/{reported_bytes} bytes, \
         received {actual_chunks} chunks/{actual_bytes} bytes"
    )]
    TotalsMismatch {
        reported_chunks: u64,
        reported_bytes: u64,
        actual_chunks: u64,
        actual_bytes: u64,
    },

    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("connection closed")]
    ConnectionClosed,
}
