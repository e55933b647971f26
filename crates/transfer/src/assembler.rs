use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use pullwire_protocol::constants::PROGRESS_EVERY_CHUNKS;

use crate::progress::{SpeedCalculator, TransferSummary};
use crate::TransferError;

/// Suffix of every sink file in the downloads directory.
pub const SINK_SUFFIX: &str = ".bin";

/// Counters after one appended chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub chunks: u64,
    pub bytes: u64,
    /// `true` on every [`PROGRESS_EVERY_CHUNKS`]th chunk.
    pub report: bool,
    pub bytes_per_second: f64,
}

/// Writes the chunks of one session to its sink file, in arrival order.
///
/// Arrival order must match `sequenceIndex`; the first out-of-order chunk is
/// rejected with [`TransferError::SequenceGap`].
pub struct Assembler {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    next_sequence: u64,
    bytes: u64,
    started: Instant,
    speed: SpeedCalculator,
}

impl Assembler {
    /// Deterministic sink location for a session.
    pub fn sink_path(dir: &Path, client_id: &str, session_id: &str) -> PathBuf {
        dir.join(format!("{client_id}_{session_id}{SINK_SUFFIX}"))
    }

    /// Creates (or truncates) the sink file, creating `dir` if needed.
    pub async fn create(dir: &Path, client_id: &str, session_id: &str) -> Result<Self, TransferError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(TransferError::SinkWrite)?;
        let path = Self::sink_path(dir, client_id, session_id);
        let file = File::create(&path).await.map_err(TransferError::SinkWrite)?;
        debug!(path = %path.display(), "sink opened");

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            next_sequence: 0,
            bytes: 0,
            started: Instant::now(),
            speed: SpeedCalculator::new(None, None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunks(&self) -> u64 {
        self.next_sequence
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Appends one chunk.
    pub async fn append(&mut self, sequence_index: u64, data: &[u8]) -> Result<ChunkProgress, TransferError> {
        if sequence_index != self.next_sequence {
            return Err(TransferError::SequenceGap {
                expected: self.next_sequence,
                got: sequence_index,
            });
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TransferError::SinkWrite(std::io::Error::other("sink already closed")))?;
        writer
            .write_all(data)
            .await
            .map_err(TransferError::SinkWrite)?;

        self.next_sequence += 1;
        self.bytes += data.len() as u64;
        self.speed.add_sample(data.len() as u64);

        Ok(ChunkProgress {
            chunks: self.next_sequence,
            bytes: self.bytes,
            report: self.next_sequence % PROGRESS_EVERY_CHUNKS == 0,
            bytes_per_second: self.speed.bytes_per_second(),
        })
    }

    /// Flushes and closes the sink, then checks the sender's totals against
    /// what was written.
    pub async fn finish(
        &mut self,
        reported_chunks: u64,
        reported_bytes: u64,
    ) -> Result<TransferSummary, TransferError> {
        self.close().await?;

        if reported_chunks != self.next_sequence || reported_bytes != self.bytes {
            return Err(TransferError::TotalsMismatch {
                reported_chunks,
                reported_bytes,
                actual_chunks: self.next_sequence,
                actual_bytes: self.bytes,
            });
        }

        Ok(TransferSummary {
            chunks: self.next_sequence,
            bytes: self.bytes,
            elapsed: self.started.elapsed(),
        })
    }

    /// Releases the sink of an unsuccessful session. The partial file is
    /// removed unless `keep_partial` is set.
    pub async fn discard(mut self, keep_partial: bool) {
        if let Err(e) = self.close().await {
            debug!(path = %self.path.display(), "flush on discard failed: {e}");
        }
        if keep_partial {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "partial sink removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove partial sink: {e}"),
        }
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.map_err(TransferError::SinkWrite)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("path", &self.path)
            .field("chunks", &self.next_sequence)
            .field("bytes", &self.bytes)
            .field("open", &self.writer.is_some())
            .finish()
    }
}
