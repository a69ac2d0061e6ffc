//! Per-proxy toxic collection.
//!
//! The collection belongs to a proxy, not to a connection: it survives every
//! link and every restart of the proxy. Relays read it once per chunk, so a
//! toxic added while traffic flows applies from the next chunk on.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use faultline_stream::{ChunkWriter, ReadChunk, WriteChunk};
use serde::Serialize;
use tracing::{debug, info, Instrument};

use crate::error::ToxicError;
use crate::link::{self, LinkCloser, LinkOwner};
use crate::toxic::Toxic;
use crate::Direction;

#[derive(Debug, Clone)]
struct ToxicEntry {
    name: String,
    direction: Direction,
    toxic: Arc<dyn Toxic>,
}

/// Listing entry for one attached toxic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToxicSummary {
    pub name: String,
    pub kind: String,
    pub direction: Direction,
}

/// Ordered set of toxics attached to one proxy.
///
/// Reads are lock-free snapshots; writers are serialized and swap in a new
/// snapshot.
#[derive(Debug)]
pub struct ToxicCollection {
    proxy: String,
    snapshot: ArcSwap<Vec<ToxicEntry>>,
    write_lock: Mutex<()>,
}

impl ToxicCollection {
    /// Create an empty collection for the proxy named `proxy`.
    pub fn new(proxy: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Name of the owning proxy.
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// Attach `toxic` to `direction` under `name`.
    ///
    /// Toxics run in the order they were added.
    pub fn add(
        &self,
        name: impl Into<String>,
        direction: Direction,
        toxic: Arc<dyn Toxic>,
    ) -> Result<(), ToxicError> {
        let name = name.into();
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load();
        if current.iter().any(|entry| entry.name == name) {
            return Err(ToxicError::AlreadyExists(name));
        }

        info!(
            proxy = %self.proxy,
            toxic = %name,
            kind = toxic.kind(),
            direction = %direction,
            "Added toxic"
        );

        let mut next = current.as_ref().clone();
        next.push(ToxicEntry {
            name,
            direction,
            toxic,
        });
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Detach the toxic named `name`.
    pub fn remove(&self, name: &str) -> Result<(), ToxicError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load();
        if !current.iter().any(|entry| entry.name == name) {
            return Err(ToxicError::NotFound(name.to_string()));
        }

        let next: Vec<ToxicEntry> = current
            .iter()
            .filter(|entry| entry.name != name)
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(next));

        info!(proxy = %self.proxy, toxic = %name, "Removed toxic");
        Ok(())
    }

    /// Detach every toxic.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshot.store(Arc::new(Vec::new()));
    }

    /// Attached toxics in run order.
    pub fn list(&self) -> Vec<ToxicSummary> {
        self.snapshot
            .load()
            .iter()
            .map(|entry| ToxicSummary {
                name: entry.name.clone(),
                kind: entry.toxic.kind().to_string(),
                direction: entry.direction,
            })
            .collect()
    }

    /// Number of attached toxics.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toxics that apply to `direction`, in run order.
    pub fn chain(&self, direction: Direction) -> Vec<Arc<dyn Toxic>> {
        self.snapshot
            .load()
            .iter()
            .filter(|entry| entry.direction == direction)
            .map(|entry| Arc::clone(&entry.toxic))
            .collect()
    }

    /// Spawn the relay for one direction of a connection.
    ///
    /// Returns immediately. The relay ends on EOF, on an I/O error or when
    /// `closer` is closed; it then closes `sink` and calls
    /// `owner.remove_connection(name, closer)`. Errors are logged, never returned.
    pub fn start_link(
        self: &Arc<Self>,
        owner: Arc<dyn LinkOwner>,
        name: String,
        source: Box<dyn ReadChunk>,
        sink: ChunkWriter<Box<dyn WriteChunk>>,
        direction: Direction,
        closer: &LinkCloser,
    ) {
        debug!(proxy = %self.proxy, link = %name, direction = %direction, "Starting link");

        let span = tracing::debug_span!("link", link = %name, direction = %direction);
        let relay = link::relay(
            Arc::clone(self),
            owner,
            name,
            source,
            sink,
            direction,
            closer.clone(),
        );
        tokio::spawn(relay.instrument(span));
    }
}
