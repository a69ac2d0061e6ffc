//! Chunk capabilities and the flush-every-chunk writer.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::StreamError;

/// Source side of a relay.
#[async_trait]
pub trait ReadChunk: Send {
    /// Read the next chunk into `buf`.
    ///
    /// `Ok(0)` means the source is exhausted.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sink side of a relay.
#[async_trait]
pub trait WriteChunk: Send {
    /// Hand `chunk` to the transport in one call.
    ///
    /// Returns how many bytes the transport accepted.
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize>;

    /// Release the transport.
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<T: ReadChunk + ?Sized> ReadChunk for Box<T> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_chunk(buf).await
    }
}

#[async_trait]
impl<T: WriteChunk + ?Sized> WriteChunk for Box<T> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        (**self).write_chunk(chunk).await
    }

    async fn close(&mut self) -> io::Result<()> {
        (**self).close().await
    }
}

#[async_trait]
impl ReadChunk for OwnedReadHalf {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

// TCP has no framing to preserve, so one chunk may take several syscalls.
#[async_trait]
impl WriteChunk for OwnedWriteHalf {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.write_all(chunk).await?;
        Ok(chunk.len())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Writer that passes every chunk straight to the transport.
///
/// A general-purpose buffered writer holds bytes back until its buffer is
/// full, which merges neighbouring packets into one send. `ChunkWriter`
/// never holds anything back: each chunk of at most `size` bytes becomes
/// exactly one call to the underlying [`WriteChunk`]. A transport that
/// accepts fewer bytes than it was given fails the chunk with
/// [`StreamError::ShortWrite`]; the remainder is not retried.
#[derive(Debug)]
pub struct ChunkWriter<W> {
    inner: W,
    size: usize,
    closed: bool,
}

impl<W: WriteChunk> ChunkWriter<W> {
    /// Wrap `inner`, emitting chunks of at most `size` bytes.
    pub fn new(inner: W, size: usize) -> Self {
        Self {
            inner,
            size: size.max(1),
            closed: false,
        }
    }

    /// Whether [`ChunkWriter::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get a reference to the wrapped transport.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Write one chunk.
    ///
    /// Chunks longer than the chunk size are cut at the chunk size; every
    /// piece is its own underlying write.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(StreamError::Closed.into());
        }

        for piece in chunk.chunks(self.size) {
            let written = self.inner.write_chunk(piece).await?;
            if written != piece.len() {
                return Err(StreamError::ShortWrite {
                    written,
                    expected: piece.len(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Release the transport. Only the first call reaches it.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }
}
