//! The toxic seam.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// A transformation applied to every chunk on one direction of a link.
#[async_trait]
pub trait Toxic: Send + Sync + Debug {
    /// Type name shown in listings.
    fn kind(&self) -> &'static str;

    /// Process one chunk. Returning `None` drops it.
    async fn pipe(&self, chunk: Bytes) -> Option<Bytes>;
}

/// Holds every chunk back for a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    pub delay: Duration,
}

impl Latency {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Toxic for Latency {
    fn kind(&self) -> &'static str {
        "latency"
    }

    async fn pipe(&self, chunk: Bytes) -> Option<Bytes> {
        tokio::time::sleep(self.delay).await;
        Some(chunk)
    }
}
