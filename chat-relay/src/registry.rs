//! Live connections, keyed by id.
//!
//! Mutations go through a short-lived lock; broadcasts iterate a cloned
//! snapshot so the lock is never held across network writes.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::connection::{Connection, ConnectionId};

#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<BTreeMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        let id = connection.id();
        let mut connections = self.lock();
        connections.insert(id, connection);
        debug!(connection = %id, members = connections.len(), "connection registered");
    }

    /// Removes `id` and closes its transport. Absent ids are ignored.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut connections = self.lock();
            let removed = connections.remove(&id);
            if removed.is_some() {
                debug!(connection = %id, members = connections.len(), "connection removed");
            }
            removed
        };

        if let Some(connection) = &removed {
            connection.close();
        }
        removed
    }

    /// Current connections in id order, i.e. the order they were accepted.
    ///
    /// Connections are closed only after they leave the map, so every entry
    /// was live when the snapshot was taken.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    /// Removes and closes every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<_> = std::mem::take(&mut *self.lock()).into_values().collect();
        for connection in &drained {
            connection.close();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Arc<Connection>>> {
        // The map stays consistent even if a holder panicked; none of the
        // critical sections can leave it half-updated.
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn connection() -> Arc<Connection> {
        let (writer, _reader) = tokio::io::duplex(64);
        Arc::new(Connection::new(
            Box::new(writer),
            None,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn insert_and_remove_track_membership() {
        let registry = Registry::new();
        let alice = connection();
        let bob = connection();

        registry.insert(Arc::clone(&alice));
        registry.insert(Arc::clone(&bob));
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(alice.id()).expect("alice registered");
        assert_eq!(removed.id(), alice.id());
        assert!(removed.is_closed());
        assert!(!registry.contains(alice.id()));
        assert!(registry.contains(bob.id()));
        assert!(!bob.is_closed());
    }

    #[test]
    fn removing_an_absent_id_is_a_no_op() {
        let registry = Registry::new();
        let alice = connection();
        registry.insert(Arc::clone(&alice));

        assert!(registry.remove(alice.id()).is_some());
        assert!(registry.remove(alice.id()).is_none());
        assert!(registry.remove(ConnectionId::next()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_and_detached() {
        let registry = Registry::new();
        let connections: Vec<_> = (0..3).map(|_| connection()).collect();
        for connection in &connections {
            registry.insert(Arc::clone(connection));
        }

        let snapshot = registry.snapshot();
        registry.remove(connections[1].id());
        registry.insert(connection());

        let ids: Vec<_> = snapshot.iter().map(|c| c.id()).collect();
        let expected: Vec<_> = connections.iter().map(|c| c.id()).collect();
        assert_eq!(ids, expected);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn drain_closes_everything() {
        let registry = Registry::new();
        let alice = connection();
        let bob = connection();
        registry.insert(Arc::clone(&alice));
        registry.insert(Arc::clone(&bob));

        let drained = registry.drain();

        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(alice.is_closed());
        assert!(bob.is_closed());
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn concurrent_inserts_and_removes_stay_consistent() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let connection = connection();
                        let id = connection.id();
                        registry.insert(connection);
                        let _ = registry.snapshot();
                        assert!(registry.remove(id).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert!(registry.is_empty());
    }
}
