//! Fixture servers for proxy tests.
//!
//! Each server runs on its own task, binds an ephemeral port on the loopback
//! interface and shuts down when dropped.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;

/// Largest datagram the UDP echo server reads.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// TCP server that writes back everything it reads.
pub struct TcpEchoServer {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoServer {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// UDP server that sends every datagram back to its sender.
///
/// Tracks the distinct source addresses it has seen; a proxy dials a fresh
/// socket per client, so this counts upstream dials.
pub struct UdpEchoServer {
    pub addr: SocketAddr,
    peers: Arc<Mutex<HashSet<SocketAddr>>>,
    datagrams: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl UdpEchoServer {
    pub async fn spawn() -> io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Serve on a specific address, e.g. one a proxy already points at.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let addr = socket.local_addr()?;
        let peers = Arc::new(Mutex::new(HashSet::new()));
        let datagrams = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let peers_clone = Arc::clone(&peers);
        let datagrams_clone = Arc::clone(&datagrams);

        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    recv_result = socket.recv_from(&mut buf) => {
                        match recv_result {
                            Ok((n, from)) => {
                                peers_clone
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .insert(from);
                                datagrams_clone.fetch_add(1, Ordering::Relaxed);
                                if socket.send_to(&buf[..n], from).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            peers,
            datagrams,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Distinct source addresses seen so far.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Datagrams echoed so far.
    pub fn datagram_count(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }
}

impl Drop for UdpEchoServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A loopback address nothing is listening on.
pub async fn closed_tcp_addr() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// A loopback UDP address nothing is bound to.
pub async fn closed_udp_addr() -> io::Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    drop(socket);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_tcp_echo() {
        let server = TcpEchoServer::spawn().await.unwrap();
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        stream.write_all(b"hello world").await.unwrap();
        let mut buf = [0u8; 11];
        timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&buf, b"hello world");
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_echo_counts_peers() {
        let server = UdpEchoServer::spawn().await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.addr).await.unwrap();

        let mut buf = [0u8; 64];
        for msg in [&b"one"[..], &b"two"[..]] {
            client.send(msg).await.unwrap();
            let n = timeout(Duration::from_secs(1), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], msg);
        }

        assert_eq!(server.peer_count(), 1);
        assert_eq!(server.datagram_count(), 2);
    }

    #[tokio::test]
    async fn test_udp_echo_truncates_to_read_buffer() {
        let server = UdpEchoServer::spawn().await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.addr).await.unwrap();

        client.send(&[1u8; 2048]).await.unwrap();

        let mut small = [0u8; 1024];
        let n = timeout(Duration::from_secs(1), client.recv(&mut small))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1024);

        // The rest of the datagram was discarded by the kernel.
        let second = timeout(Duration::from_millis(200), client.recv(&mut small)).await;
        assert!(second.is_err());
    }
}
