//! The client's reference table: at most one proxy per reference.
//!
//! Proxies stay in the table until they are released, so their lifetime
//! follows explicit `release` calls. The most recent released references of
//! the current server session are remembered so they are never handed out as
//! live again. A new server session starts with an empty memory.

use super::client::ClientInner;
use super::proxy::RemoteObject;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

/// Released references remembered per server session.
const RELEASED_MEMORY: usize = 4096;

#[derive(Default)]
struct Tables {
    live: HashMap<String, RemoteObject>,
    released: HashSet<String>,
    released_order: VecDeque<String>,
}

impl Tables {
    fn remember_released(&mut self, reference: &str) {
        if !self.released.insert(reference.to_string()) {
            return;
        }
        self.released_order.push_back(reference.to_string());
        while self.released_order.len() > RELEASED_MEMORY {
            if let Some(oldest) = self.released_order.pop_front() {
                self.released.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ObjectTable {
    tables: Mutex<Tables>,
}

impl ObjectTable {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The proxy for `reference`, created on first sight.
    pub(crate) fn get_or_insert(
        &self,
        reference: &str,
        type_name: &str,
        client: &Weak<ClientInner>,
    ) -> RemoteObject {
        let mut tables = self.lock();
        if let Some(proxy) = tables.live.get(reference) {
            return proxy.clone();
        }
        if tables.released.contains(reference) {
            return RemoteObject::released(reference, type_name, client.clone());
        }
        let proxy = RemoteObject::live(reference, type_name, client.clone());
        tables.live.insert(reference.to_string(), proxy.clone());
        proxy
    }

    /// Adopt a proxy patched after a transaction commit.
    pub(crate) fn insert(&self, reference: &str, proxy: RemoteObject) {
        self.lock().live.insert(reference.to_string(), proxy);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, reference: &str) -> Option<RemoteObject> {
        self.lock().live.get(reference).cloned()
    }

    pub(crate) fn mark_released(&self, reference: &str) {
        let mut tables = self.lock();
        tables.live.remove(reference);
        tables.remember_released(reference);
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self, reference: &str) -> bool {
        self.lock().released.contains(reference)
    }

    /// Kill every live proxy and forget released references. Used when the
    /// server session was lost: its references mean nothing to the next one.
    pub(crate) fn invalidate_all(&self) -> usize {
        let mut tables = self.lock();
        let live: Vec<(String, RemoteObject)> = tables.live.drain().collect();
        for (_, proxy) in &live {
            proxy.mark_released();
        }
        tables.released.clear();
        tables.released_order.clear();
        live.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().live.len()
    }

    #[cfg(test)]
    fn released_len(&self) -> usize {
        self.lock().released.len()
    }
}
