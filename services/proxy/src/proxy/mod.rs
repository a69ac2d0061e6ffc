//! Proxy engine.
//!
//! A [`Proxy`] owns one listening socket and the links relaying traffic for
//! the peers it admits:
//!
//! - `supervisor` - start/stop/update state machine
//! - `tcp` - accept loop for stream proxies
//! - `udp` - receive loop that synthesizes a virtual connection per peer
//! - `registry` - live links, closed in bulk on stop

mod registry;
mod supervisor;
mod tcp;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use faultline_stream::{ChunkWriter, ReadChunk, WriteChunk};
use faultline_toxics::{Direction, LinkCloser, ToxicCollection, LINK_BUFFER_SIZE};
use tokio::net::lookup_host;
use tokio::sync::{oneshot, watch};

use crate::config::UdpSessionPolicy;
use crate::error::ProxyError;

pub use registry::{link_name, ConnectionRegistry};
pub use supervisor::Proxy;

/// Readiness report from a listener to the `start` call waiting on it.
pub(crate) type ReadyTx = oneshot::Sender<Result<SocketAddr, ProxyError>>;

/// Everything a running listener needs from its proxy.
#[derive(Debug)]
pub(crate) struct ListenerContext {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    pub connections: Arc<ConnectionRegistry>,
    pub toxics: Arc<ToxicCollection>,
    pub udp_policy: UdpSessionPolicy,
}

impl ListenerContext {
    /// Start the relay for one direction of the connection from `peer`.
    ///
    /// The link is named after the peer and direction; its relay removes
    /// that name from the registry when it ends.
    pub fn attach_link<R, W>(
        &self,
        peer: &str,
        source: R,
        sink: W,
        direction: Direction,
        closer: &LinkCloser,
    ) where
        R: ReadChunk + 'static,
        W: WriteChunk + 'static,
    {
        let sink: Box<dyn WriteChunk> = Box::new(sink);
        self.toxics.start_link(
            self.connections.clone(),
            link_name(peer, direction),
            Box::new(source),
            ChunkWriter::new(sink, LINK_BUFFER_SIZE),
            direction,
            closer,
        );
    }
}

/// Resolves once the supervisor asks the loop to stop.
///
/// A dropped supervisor counts as a stop request.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Whether a stop has been requested, without waiting.
pub(crate) fn is_stopping(stop: &watch::Receiver<bool>) -> bool {
    stop.has_changed().is_err() || *stop.borrow()
}

/// Resolve the configured listen address to its first socket address.
pub(crate) async fn resolve_listen(listen: &str) -> Result<SocketAddr, ProxyError> {
    let resolve_err = |source: io::Error| ProxyError::Resolve {
        addr: listen.to_string(),
        source,
    };

    lookup_host(listen)
        .await
        .map_err(resolve_err)?
        .next()
        .ok_or_else(|| {
            resolve_err(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses resolved",
            ))
        })
}
