//! Proxy errors.

use std::io;

use thiserror::Error;

/// Errors returned by proxies and the proxy collection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `start` was called on a running proxy.
    #[error("proxy already started: {0}")]
    AlreadyStarted(String),

    /// The listen address could not be resolved.
    #[error("failed to resolve listen address {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    /// The listening socket could not be created.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// The upstream could not be resolved or dialed for one peer.
    #[error("upstream unreachable {addr}: {source}")]
    UpstreamUnreachable { addr: String, source: io::Error },

    /// The accept loop ended before reporting readiness.
    #[error("proxy listener exited before it was ready")]
    ListenerExited,

    /// A proxy with this name is already registered.
    #[error("proxy already exists: {0}")]
    ProxyExists(String),

    /// No proxy with this name is registered.
    #[error("proxy not found: {0}")]
    ProxyNotFound(String),

    /// A required configuration field is empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The configuration could not be applied.
    #[error("invalid proxy config: {0}")]
    InvalidConfig(String),
}
