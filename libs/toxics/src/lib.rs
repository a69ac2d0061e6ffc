//! Toxic chains and link relays.
//!
//! A link is one direction of traffic between a client and an upstream:
//!
//! ```text
//! client ──(upstream link)──► upstream
//! client ◄─(downstream link)── upstream
//! ```
//!
//! Each link is a task that reads chunks from its source, runs them through
//! the toxics registered for its direction and writes them to its sink. The
//! proxy that owns the link hears about its end through [`LinkOwner`], and
//! can end it early through the link's [`LinkCloser`].

mod collection;
mod error;
mod link;
mod toxic;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use collection::{ToxicCollection, ToxicSummary};
pub use error::ToxicError;
pub use link::{LinkCloser, LinkOwner, LINK_BUFFER_SIZE};
pub use toxic::{Latency, Toxic};

/// Direction of traffic on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to upstream.
    Upstream,
    /// Upstream to client.
    Downstream,
}

impl Direction {
    /// Suffix appended to a peer name to form the link name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
