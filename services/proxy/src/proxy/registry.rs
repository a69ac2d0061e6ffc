//! Live link registry.
//!
//! Every connection a proxy relays shows up here twice, once per direction,
//! as `{peer}upstream` and `{peer}downstream`. Each entry holds the closer
//! its link stops on.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use faultline_toxics::{Direction, LinkCloser, LinkOwner};
use tracing::debug;

/// Link name for one direction of the connection from `peer`.
pub fn link_name(peer: &str, direction: Direction) -> String {
    format!("{peer}{}", direction.as_str())
}

/// Name-to-closer map of a proxy's live links.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    list: Mutex<HashMap<String, LinkCloser>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LinkCloser>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one link. A previous entry under the same name is replaced.
    pub fn insert(&self, name: impl Into<String>, closer: LinkCloser) {
        self.lock().insert(name.into(), closer);
    }

    /// Register both directions of the connection from `peer` at once.
    pub fn insert_pair(&self, peer: &str, closer: &LinkCloser) {
        let mut list = self.lock();
        list.insert(link_name(peer, Direction::Upstream), closer.clone());
        list.insert(link_name(peer, Direction::Downstream), closer.clone());
    }

    /// Forget the link named `name` if it is still registered under
    /// `closer`. Unknown names and entries a newer link has taken over are
    /// left alone.
    pub fn remove(&self, name: &str, closer: &LinkCloser) {
        let mut list = self.lock();
        if list.get(name).is_some_and(|current| current.same_link(closer)) {
            list.remove(name);
            debug!(link = %name, "Removed connection");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Number of live links (two per relayed connection).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names of the live links, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every registered link and wait for their relays to exit.
    ///
    /// The registry is empty when this returns, and every transport the
    /// closed links held has been released. Returns the number of entries
    /// that were registered.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, LinkCloser)> = self.lock().drain().collect();
        let count = drained.len();

        for (_, closer) in &drained {
            closer.close();
        }
        for (name, closer) in &drained {
            closer.wait_closed().await;
            debug!(link = %name, "Closed connection");
        }

        count
    }
}

impl LinkOwner for ConnectionRegistry {
    fn remove_connection(&self, name: &str, closer: &LinkCloser) {
        self.remove(name, closer);
    }
}
