//! Process-lifetime cache of backend clients
//!
//! Cloud adapters build one client per location: the location decides which
//! credential set applies (a per-location override or the defaults), and
//! the client is reused for every later call against that location. Entries
//! are created lazily and never evicted.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

pub struct ClientCache<K, C: ?Sized> {
    clients: DashMap<K, Arc<C>>,
}

impl<K, C> ClientCache<K, C>
where
    K: Eq + Hash + Clone,
    C: ?Sized,
{
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Return the cached client for `key`, building it with `init` on first use.
    ///
    /// Concurrent first calls may both run `init`; the first insert wins and
    /// every caller gets that instance.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>, E>>,
    {
        let cached = self.clients.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = init().await?;
        let entry = self.clients.entry(key).or_insert(client);
        Ok(Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl<K, C> Default for ClientCache<K, C>
where
    K: Eq + Hash + Clone,
    C: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}
