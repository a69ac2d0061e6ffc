//! Directional link relay.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use faultline_stream::{ChunkWriter, ReadChunk, StreamError, WriteChunk, MAX_DATAGRAM_SIZE};
use tokio::sync::watch;
use tracing::debug;

use crate::collection::ToxicCollection;
use crate::Direction;

/// Largest chunk a relay reads at once. Fits any UDP payload.
pub const LINK_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE;

/// The party that tracks live links, told when one of them ends.
pub trait LinkOwner: Send + Sync + Debug {
    /// Forget the link named `name` if it is still registered under
    /// `closer`. A newer link may have taken over the name by then.
    fn remove_connection(&self, name: &str, closer: &LinkCloser);
}

/// Close handle shared by the relays of one connection.
///
/// Closing it makes every subscribed relay stop, release its source and
/// sink and exit.
#[derive(Debug, Clone)]
pub struct LinkCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl LinkCloser {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Signal every relay to stop.
    ///
    /// Returns `false` if the closer was already closed.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Whether `other` is a handle on the same connection.
    pub fn same_link(&self, other: &LinkCloser) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Wait until every relay subscribed to this closer has exited.
    pub async fn wait_closed(&self) {
        self.tx.closed().await
    }
}

impl Default for LinkCloser {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the closer is closed.
async fn close_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|closed| *closed).await.is_ok();
    if !closed {
        // Every closer handle is gone; nothing can close this link anymore.
        std::future::pending::<()>().await;
    }
}

#[derive(Debug)]
enum LinkEnd {
    Eof { bytes: u64 },
    Closed,
}

pub(crate) async fn relay(
    toxics: Arc<ToxicCollection>,
    owner: Arc<dyn LinkOwner>,
    name: String,
    mut source: Box<dyn ReadChunk>,
    mut sink: ChunkWriter<Box<dyn WriteChunk>>,
    direction: Direction,
    closer: LinkCloser,
) {
    let mut closed = closer.subscribe();
    let mut buf = vec![0u8; LINK_BUFFER_SIZE];

    let result = tokio::select! {
        biased;
        _ = close_requested(&mut closed) => Ok(LinkEnd::Closed),
        result = pump(&toxics, direction, source.as_mut(), &mut sink, &mut buf) => result,
    };

    match result {
        Ok(LinkEnd::Eof { bytes }) => debug!(bytes, "Link reached end of stream"),
        Ok(LinkEnd::Closed) => debug!("Link closed"),
        Err(e) => debug!(
            error = %e,
            short_write = StreamError::is_short_write(&e),
            "Link terminated"
        ),
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Failed to close link sink");
    }

    // Transports go before the close subscription, so `wait_closed`
    // resolving means the sockets are released.
    drop(source);
    drop(sink);
    owner.remove_connection(&name, &closer);
    drop(closed);
}

async fn pump(
    toxics: &ToxicCollection,
    direction: Direction,
    source: &mut dyn ReadChunk,
    sink: &mut ChunkWriter<Box<dyn WriteChunk>>,
    buf: &mut [u8],
) -> io::Result<LinkEnd> {
    let mut total = 0u64;

    loop {
        let n = source.read_chunk(buf).await?;
        if n == 0 {
            return Ok(LinkEnd::Eof { bytes: total });
        }

        let chain = toxics.chain(direction);
        if chain.is_empty() {
            sink.write_chunk(&buf[..n]).await?;
            total += n as u64;
            continue;
        }

        let mut chunk = Some(Bytes::copy_from_slice(&buf[..n]));
        for toxic in &chain {
            match chunk.take() {
                Some(c) => chunk = toxic.pipe(c).await,
                None => break,
            }
        }

        if let Some(chunk) = chunk {
            sink.write_chunk(&chunk).await?;
            total += chunk.len() as u64;
        }
    }
}
