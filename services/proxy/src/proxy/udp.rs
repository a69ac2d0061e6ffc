//! UDP receive loop.
//!
//! One bound socket serves every client. The first datagram from a new peer
//! opens a virtual connection: a fresh upstream socket plus two packet pipes
//! standing in for the client side.
//!
//! ```text
//!             inbound pipe              connected socket
//! recv_from ─────────────► (upstream link) ─────────────► upstream
//!  send_to  ◄── drain ◄─── (downstream link) ◄─────────── upstream
//!             outbound pipe
//! ```
//!
//! Every datagram crosses each stage as one packet. Virtual connections
//! live until the proxy stops unless an idle timeout is configured.

use std::collections::HashMap;
use std::future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use faultline_stream::{
    datagram_halves, is_unreachable_report, packet_pipe, PacketReader, PacketWriter, StreamError,
    DEFAULT_PIPE_DEPTH, MAX_DATAGRAM_SIZE,
};
use faultline_toxics::{Direction, LinkCloser};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use super::{is_stopping, resolve_listen, stop_requested, ListenerContext, ReadyTx};
use crate::error::ProxyError;

/// Shortest period between idle sweeps.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// Receive-loop view of one virtual connection.
struct Session {
    inbound: PacketWriter,
    closer: LinkCloser,
    last_seen: Instant,
}

async fn bind(listen: &str) -> Result<UdpSocket, ProxyError> {
    let addr = resolve_listen(listen).await?;
    UdpSocket::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: listen.to_string(),
            source,
        })
}

/// Bind, report readiness, then demultiplex datagrams until stopped.
///
/// Returns after every per-peer drain task has finished, so the socket is
/// released by then.
pub(crate) async fn serve(
    ctx: Arc<ListenerContext>,
    mut stop: watch::Receiver<bool>,
    ready: ReadyTx,
) {
    let socket = match bind(&ctx.listen).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(source) => {
            let _ = ready.send(Err(ProxyError::Bind {
                addr: ctx.listen.clone(),
                source,
            }));
            return;
        }
    };

    if ready.send(Ok(local_addr)).is_err() {
        return;
    }
    info!(name = %ctx.name, listen = %local_addr, "Started proxy");

    let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
    let mut drains = JoinSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let idle_timeout = ctx.udp_policy.idle_timeout;
    let mut sweep = idle_timeout.map(|idle| {
        let mut interval = time::interval((idle / 2).max(MIN_SWEEP_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        while drains.try_join_next().is_some() {}

        let received = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            _ = next_sweep(&mut sweep) => {
                if let Some(idle) = idle_timeout {
                    evict_idle(&mut sessions, idle);
                }
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };

        let (n, peer) = match received {
            Ok(received) => received,
            Err(e) if is_unreachable_report(&e) => {
                debug!(error = %e, "Ignoring receive error");
                continue;
            }
            Err(e) => {
                if !is_stopping(&stop) {
                    warn!(error = %e, "Error while accepting client");
                }
                break;
            }
        };
        let datagram = &buf[..n];

        if let Some(session) = sessions.get_mut(&peer) {
            let sent = if session.closer.is_closed() {
                Err(StreamError::Closed)
            } else {
                session.inbound.try_send(datagram)
            };
            match sent {
                Ok(()) => {
                    session.last_seen = Instant::now();
                    continue;
                }
                Err(StreamError::Full) => {
                    debug!(client = %peer, bytes = n, "Virtual connection backed up, dropping datagram");
                    continue;
                }
                Err(_) => {
                    // One of the links is gone; start over with a new pair.
                    debug!(client = %peer, "Rebuilding virtual connection");
                    if let Some(session) = sessions.remove(&peer) {
                        session.closer.close();
                    }
                }
            }
        }

        info!(client = %peer, "Accepted client");

        let upstream = match resolve_upstream(&ctx.upstream).await {
            Ok(addr) => addr,
            Err(e) => {
                error!(client = %peer, error = %e, "Unable to resolve upstream address");
                continue;
            }
        };

        let session = match open_session(&ctx, &socket, peer, upstream, &stop, &mut drains).await
        {
            Ok(session) => session,
            Err(e) => {
                error!(client = %peer, error = %e, "Unable to open connection to upstream");
                continue;
            }
        };

        if let Err(e) = session.inbound.try_send(datagram) {
            debug!(client = %peer, error = %e, "Failed to forward first datagram");
        }
        sessions.insert(peer, session);
    }

    // Closing the links ends the downstream relays, which ends the drains.
    for session in sessions.into_values() {
        session.closer.close();
    }
    while drains.join_next().await.is_some() {}

    debug!(listen = %local_addr, "Receive loop exited");
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

fn evict_idle(sessions: &mut HashMap<SocketAddr, Session>, idle: Duration) {
    let now = Instant::now();
    sessions.retain(|peer, session| {
        let keep = now.duration_since(session.last_seen) < idle;
        if !keep {
            info!(client = %peer, idle_ms = idle.as_millis() as u64, "Evicting idle client");
            session.closer.close();
        }
        keep
    });
}

async fn resolve_upstream(upstream: &str) -> Result<SocketAddr, ProxyError> {
    let unreachable = |source: io::Error| ProxyError::UpstreamUnreachable {
        addr: upstream.to_string(),
        source,
    };

    lookup_host(upstream)
        .await
        .map_err(unreachable)?
        .next()
        .ok_or_else(|| {
            unreachable(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses resolved",
            ))
        })
}

async fn dial_upstream(upstream: &str, addr: SocketAddr) -> Result<UdpSocket, ProxyError> {
    let unreachable = |source: io::Error| ProxyError::UpstreamUnreachable {
        addr: upstream.to_string(),
        source,
    };

    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local).await.map_err(unreachable)?;
    socket.connect(addr).await.map_err(unreachable)?;
    Ok(socket)
}

/// Build the virtual connection for `peer` and start its links and drain.
async fn open_session(
    ctx: &ListenerContext,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    upstream: SocketAddr,
    stop: &watch::Receiver<bool>,
    drains: &mut JoinSet<()>,
) -> Result<Session, ProxyError> {
    let upstream_socket = dial_upstream(&ctx.upstream, upstream).await?;
    let (upstream_reader, upstream_writer) = datagram_halves(upstream_socket, MAX_DATAGRAM_SIZE);

    let (inbound_reader, inbound) = packet_pipe(DEFAULT_PIPE_DEPTH);
    let (outbound, outbound_writer) = packet_pipe(DEFAULT_PIPE_DEPTH);

    let peer_name = peer.to_string();
    let closer = LinkCloser::new();

    ctx.connections.insert_pair(&peer_name, &closer);
    ctx.attach_link(
        &peer_name,
        inbound_reader,
        upstream_writer,
        Direction::Upstream,
        &closer,
    );
    ctx.attach_link(
        &peer_name,
        upstream_reader,
        outbound_writer,
        Direction::Downstream,
        &closer,
    );

    drains.spawn(
        drain(Arc::clone(socket), peer, outbound, closer.clone(), stop.clone()).in_current_span(),
    );

    Ok(Session {
        inbound,
        closer,
        last_seen: Instant::now(),
    })
}

/// Send everything the downstream link produces back to `peer`, one
/// datagram per packet.
///
/// When the downstream link ends the whole virtual connection is closed,
/// so the receive loop rebuilds it on the peer's next datagram.
async fn drain(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut outbound: PacketReader,
    closer: LinkCloser,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let read = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            read = outbound.recv(&mut buf) => read,
        };

        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if let Err(e) = socket.send_to(&buf[..n], peer).await {
            warn!(client = %peer, error = %e, "Failed to send datagram to client");
        }
    }

    closer.close();
    debug!(client = %peer, "Virtual connection drained");
}
