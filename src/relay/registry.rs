//! Registry of connected clients.
//!
//! Mutation takes the write lock; broadcasting takes the read lock only
//! long enough to clone the client handles, so no network I/O ever happens
//! while the lock is held.

use crate::relay::connection::Client;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared map from client identity to its send handle.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    clients: Arc<RwLock<HashMap<Arc<str>, Arc<Client>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a client. Returns `false`, leaving the existing entry alone,
    /// if the identity is already registered.
    pub fn add(&self, client: Arc<Client>) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.contains_key(client.id()) {
            return false;
        }
        clients.insert(Arc::clone(client.id()), client);
        true
    }

    /// Remove by identity. Removing an absent identity is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<Client>> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Remove `client` only if it is the entry currently registered under
    /// its identity, so a stale handle never evicts a newer client that
    /// reused the same address.
    pub fn remove_client(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let is_current = clients
            .get(client.id())
            .is_some_and(|current| Arc::ptr_eq(current, client));
        if is_current {
            clients.remove(client.id());
        }
        is_current
    }

    /// Copy of the current client handles.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    #[allow(dead_code)]
    pub fn contains(&self, id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
