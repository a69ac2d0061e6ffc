//! Faultline proxy
//!
//! TCP and UDP proxies that relay traffic between clients and an upstream
//! through per-direction toxic chains.
//!
//! - [`Proxy`] owns one listen/upstream pair and its start/stop lifecycle
//! - [`ProxyCollection`] owns every proxy of a process
//! - [`ConnectionRegistry`] tracks the live links of one proxy

pub mod collection;
pub mod config;
pub mod error;
pub mod proxy;

pub use collection::ProxyCollection;
pub use config::{Config, Protocol, ProxyConfig, UdpSessionPolicy};
pub use error::ProxyError;
pub use proxy::{link_name, ConnectionRegistry, Proxy};
