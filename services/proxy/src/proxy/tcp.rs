//! TCP accept loop.
//!
//! Each accepted client is paired with a fresh upstream connection. The two
//! sockets are split and relayed by two links that share one closer:
//!
//! ```text
//! client read  ──(upstream link)──►  upstream write
//! client write ◄─(downstream link)── upstream read
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use faultline_toxics::{Direction, LinkCloser};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{is_stopping, resolve_listen, stop_requested, ListenerContext, ReadyTx};
use crate::error::ProxyError;

async fn bind(listen: &str) -> Result<TcpListener, ProxyError> {
    let addr = resolve_listen(listen).await?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: listen.to_string(),
            source,
        })
}

/// Bind, report readiness, then accept clients until stopped.
///
/// The listener is dropped when this returns.
pub(crate) async fn serve(
    ctx: Arc<ListenerContext>,
    mut stop: watch::Receiver<bool>,
    ready: ReadyTx,
) {
    let listener = match bind(&ctx.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let local_addr = match listener.local_addr() {
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
        // The start call went away before we were bound.
        return;
    }
    info!(name = %ctx.name, listen = %local_addr, "Started proxy");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((client, peer)) => handle_client(&ctx, &mut stop, client, peer).await,
            Err(e) => {
                if !is_stopping(&stop) {
                    warn!(error = %e, "Error while accepting client");
                }
                break;
            }
        }
    }

    debug!(listen = %local_addr, "Accept loop exited");
}

async fn handle_client(
    ctx: &ListenerContext,
    stop: &mut watch::Receiver<bool>,
    client: TcpStream,
    peer: SocketAddr,
) {
    info!(client = %peer, "Accepted client");

    let dialed = tokio::select! {
        biased;
        _ = stop_requested(stop) => return,
        dialed = TcpStream::connect(ctx.upstream.as_str()) => dialed,
    };
    let upstream = match dialed {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(client = %peer, error = %e, "Unable to open connection to upstream");
            return;
        }
    };

    for stream in [&client, &upstream] {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let peer_name = peer.to_string();
    let closer = LinkCloser::new();
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    ctx.connections.insert_pair(&peer_name, &closer);
    ctx.attach_link(
        &peer_name,
        client_read,
        upstream_write,
        Direction::Upstream,
        &closer,
    );
    ctx.attach_link(
        &peer_name,
        upstream_read,
        client_write,
        Direction::Downstream,
        &closer,
    );
}
