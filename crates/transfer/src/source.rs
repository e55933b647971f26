use std::path::Path;

use tokio::io::AsyncReadExt;

use pullwire_protocol::constants::DEFAULT_CHUNK_SIZE;

use crate::TransferError;

/// Reads a file sequentially in fixed-size chunks.
///
/// Every chunk except the last is exactly `chunk_size` bytes, regardless of
/// how the underlying reads are split.
pub struct ChunkSource {
    file: tokio::fs::File,
    chunk_size: usize,
    offset: u64,
    eof: bool,
}

impl ChunkSource {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used. A missing file
    /// maps to [`TransferError::FileNotFound`].
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::FileNotFound(path.display().to_string())
            } else {
                TransferError::SourceRead(e)
            }
        })?;
        let meta = file.metadata().await.map_err(TransferError::SourceRead)?;
        if !meta.is_file() {
            return Err(TransferError::FileNotFound(path.display().to_string()));
        }
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            chunk_size,
            offset: 0,
            eof: false,
        })
    }

    /// Reads the next chunk. Returns `None` at end of file.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(self.chunk_size);
        while buf.len() < self.chunk_size {
            let n = (&mut self.file)
                .take((self.chunk_size - buf.len()) as u64)
                .read_to_end(&mut buf)
                .await
                .map_err(TransferError::SourceRead)?;
            if n == 0 {
                self.eof = true;
                break;
            }
        }

        if buf.is_empty() {
            return Ok(None);
        }
        self.offset += buf.len() as u64;
        Ok(Some(buf))
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
