//! Write units with an explicit flush decision.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::TunnelError;

/// An ordered batch of chunks written as one unit.
#[derive(Clone, Debug, Default)]
pub struct Brigade {
    chunks: Vec<Bytes>,
    flush: bool,
}

impl Brigade {
    #[must_use]
    pub fn new(flush: bool) -> Self {
        Self {
            chunks: Vec::new(),
            flush,
        }
    }

    #[must_use]
    pub fn with_chunk(chunk: impl Into<Bytes>, flush: bool) -> Self {
        let mut brigade = Self::new(flush);
        brigade.push(chunk);
        brigade
    }

    /// Appends a chunk; empty chunks are dropped.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    #[must_use]
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total number of bytes across all chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn flush(&self) -> bool {
        self.flush
    }

    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush;
    }
}

/// Writes every chunk of `brigade` in order, then flushes the transport if the
/// brigade asks for it.
///
/// Partial progress is not rolled back: on error, `TunnelError::Write` carries
/// how many bytes were accepted by the transport before the failure.
pub async fn write_brigade<W>(writer: &mut W, brigade: &Brigade) -> Result<usize, TunnelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;

    for chunk in brigade.chunks() {
        let mut remaining = &chunk[..];
        while !remaining.is_empty() {
            match writer.write(remaining).await {
                Ok(0) => {
                    return Err(TunnelError::Write {
                        written,
                        source: io::ErrorKind::WriteZero.into(),
                    });
                }
                Ok(n) => {
                    written += n;
                    remaining = &remaining[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(TunnelError::Write { written, source }),
            }
        }
    }

    if brigade.flush() {
        writer
            .flush()
            .await
            .map_err(|source| TunnelError::Write { written, source })?;
    }

    trace!(bytes = written, flush = brigade.flush(), "Brigade written");
    Ok(written)
}
