//! In-memory packet pipe.
//!
//! Stands in for a socket on the client side of a UDP virtual connection.
//! Each `send` is one message on a bounded queue and each `recv` returns the
//! next message, so packet boundaries survive the trip as long as the read
//! buffer can hold a whole packet. A smaller buffer gets the rest of the
//! packet on the following reads.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::chunk::{ReadChunk, WriteChunk};
use crate::error::StreamError;

/// Packets a pipe queues before `send` waits and `try_send` fails.
pub const DEFAULT_PIPE_DEPTH: usize = 128;

/// Create a pipe that queues up to `depth` packets.
pub fn packet_pipe(depth: usize) -> (PacketReader, PacketWriter) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        PacketReader {
            rx,
            pending: Bytes::new(),
        },
        PacketWriter { tx: Some(tx) },
    )
}

/// Read end of a packet pipe.
#[derive(Debug)]
pub struct PacketReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl PacketReader {
    /// Read the next packet (or the unread rest of the current one).
    ///
    /// Returns `Ok(0)` once the writer is closed and the queue is drained.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.rx.recv().await {
                Some(packet) => self.pending = packet,
                None => return Ok(0),
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

#[async_trait]
impl ReadChunk for PacketReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).await
    }
}

/// Write end of a packet pipe.
#[derive(Debug)]
pub struct PacketWriter {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl PacketWriter {
    /// Enqueue one packet, waiting for room.
    ///
    /// Empty packets are dropped; the reader uses a zero-length read for EOF.
    pub async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let tx = self.tx.as_ref().ok_or(StreamError::Closed)?;
        if packet.is_empty() {
            return Ok(0);
        }

        tx.send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| StreamError::Closed)?;
        Ok(packet.len())
    }

    /// Enqueue one packet without waiting.
    pub fn try_send(&self, packet: &[u8]) -> Result<(), StreamError> {
        let tx = self.tx.as_ref().ok_or(StreamError::Closed)?;
        if packet.is_empty() {
            return Ok(());
        }

        tx.try_send(Bytes::copy_from_slice(packet))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => StreamError::Full,
                mpsc::error::TrySendError::Closed(_) => StreamError::Closed,
            })
    }

    /// Whether the pipe can no longer carry packets.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Close the write end. The reader sees EOF after the queued packets.
    pub fn close(&mut self) {
        self.tx.take();
    }
}

#[async_trait]
impl WriteChunk for PacketWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.send(chunk).await
    }

    async fn close(&mut self) -> io::Result<()> {
        PacketWriter::close(self);
        Ok(())
    }
}
