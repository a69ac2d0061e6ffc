//! Framed halves of a connected UDP socket.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::chunk::{ReadChunk, WriteChunk};
use crate::error::StreamError;

/// Split a connected socket into a reader and a writer.
///
/// The reader stages each datagram in a buffer of `buffer_size` bytes, so a
/// single `recv` always captures a whole datagram up to that size.
pub fn datagram_halves(socket: UdpSocket, buffer_size: usize) -> (DatagramReader, DatagramWriter) {
    let socket = Arc::new(socket);
    (
        DatagramReader {
            socket: Arc::clone(&socket),
            buf: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
        },
        DatagramWriter {
            socket: Some(socket),
        },
    )
}

/// Whether `err` is an ICMP unreachable report surfacing on a UDP socket.
///
/// The kernel hands these back on the next call after a datagram bounced.
/// They describe a datagram that is already gone, not the socket, which
/// stays usable.
pub fn is_unreachable_report(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Read half of a connected UDP socket.
#[derive(Debug)]
pub struct DatagramReader {
    socket: Arc<UdpSocket>,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl DatagramReader {
    /// Copy out the next datagram (or the unread rest of the current one).
    ///
    /// Unreachable reports from the peer are skipped; the peer may come
    /// back later.
    pub async fn recv(&mut self, out: &mut [u8]) -> io::Result<usize> {
        // Zero-length datagrams would read as EOF; skip them.
        while self.start == self.end {
            let n = match self.socket.recv(&mut self.buf).await {
                Ok(n) => n,
                Err(e) if is_unreachable_report(&e) => continue,
                Err(e) => return Err(e),
            };
            self.start = 0;
            self.end = n;
        }

        let n = (self.end - self.start).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }
}

#[async_trait]
impl ReadChunk for DatagramReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).await
    }
}

/// Write half of a connected UDP socket.
#[derive(Debug)]
pub struct DatagramWriter {
    socket: Option<Arc<UdpSocket>>,
}

impl DatagramWriter {
    /// Send `packet` as a single datagram.
    ///
    /// A pending unreachable report left by an earlier datagram fails the
    /// call without sending, so the send is tried once more.
    pub async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let socket = self.socket.as_ref().ok_or(StreamError::Closed)?;
        match socket.send(packet).await {
            Err(e) if is_unreachable_report(&e) => socket.send(packet).await,
            result => result,
        }
    }
}

#[async_trait]
impl WriteChunk for DatagramWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.send(chunk).await
    }

    async fn close(&mut self) -> io::Result<()> {
        // The socket is released once the reader is gone as well.
        self.socket.take();
        Ok(())
    }
}
