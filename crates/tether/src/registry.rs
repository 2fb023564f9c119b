//! Explicit registry of live clients.
//!
//! Hosts that manage several plugins pass one registry to each
//! [`ClientConfig`](crate::ClientConfig) and call
//! [`ClientRegistry::kill_all`] on shutdown. Registries are plain values, so
//! independent hosts (or tests) never share one by accident.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::info;

use crate::client::{Client, ClientCore};
use crate::context::Context;

const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

/// Cloneable handle to a set of clients. Clones share the same set.
///
/// The registry holds weak references: dropping every [`Client`] handle
/// removes the client without killing it.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Mutex<Vec<Weak<ClientCore>>>>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client`. Registering the same client twice has no effect.
    pub fn register(&self, client: &Client) {
        let core = Arc::downgrade(client.core());
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|entry| entry.strong_count() > 0);
        if !clients.iter().any(|entry| entry.ptr_eq(&core)) {
            clients.push(core);
        }
    }

    /// Kills every registered client that has not exited and empties the
    /// registry. Returns how many clients were killed.
    pub fn kill_all(&self, ctx: &Context) -> usize {
        let live: Vec<Arc<ClientCore>> = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            clients.drain(..).filter_map(|entry| entry.upgrade()).collect()
        };
        let mut killed = 0;
        for core in live {
            if !core.exited() {
                killed += 1;
            }
            core.kill(ctx);
        }
        info!(target: REGISTRY_TARGET, killed, "killed registered plugin clients");
        killed
    }

    /// Number of registered clients that are still alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|core| !core.exited())
            .count()
    }

    /// Whether no registered client is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("live", &self.len())
            .finish()
    }
}
