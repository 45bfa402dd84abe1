//! Registry of live clients and the id pool backing it.
//!
//! Both the TCP accept task and the UDP receive task touch the registry
//! concurrently, so every operation here takes a lock and is linearizable:
//! - an id is reserved before its client exists and freed only on removal
//! - two entries never share an id
//! - removal only succeeds for the exact client instance registered under it

use crate::client::Client;
use crate::id_allocator::IdAllocator;
use log::warn;
use parking_lot::{Mutex, RwLock};
use shared::ClientId;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ClientManager {
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    ids: Mutex<IdAllocator>,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::with_capacity(max_clients)),
            ids: Mutex::new(IdAllocator::new(max_clients)),
        }
    }

    /// Claims an id for a connection that is about to be built.
    /// Returns `None` when the server is full.
    pub fn reserve_id(&self) -> Option<ClientId> {
        self.ids.lock().find_available_id()
    }

    /// Returns an id whose connection was refused before registration.
    pub fn release_id(&self, id: ClientId) {
        if self.clients.read().contains_key(&id) {
            warn!("Refusing to release id {} still held by a live client", id);
            return;
        }
        self.ids.lock().free_id(id);
    }

    /// Registers a client under its reserved id.
    pub fn insert(&self, client: Arc<Client>) -> bool {
        let mut clients = self.clients.write();
        if clients.contains_key(&client.id()) {
            warn!("Client id {} already registered", client.id());
            return false;
        }
        clients.insert(client.id(), client);
        true
    }

    /// Unregisters `client` and frees its id. A different client that has
    /// since been registered under the same id is left alone.
    pub fn remove(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.clients.write();
        match clients.get(&client.id()) {
            Some(registered) if Arc::ptr_eq(registered, client) => {
                clients.remove(&client.id());
                self.ids.lock().free_id(client.id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(&id).cloned()
    }

    /// Copies out every live client so callers can iterate without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }

    /// Empties the registry and frees every id.
    pub fn clear(&self) -> Vec<Arc<Client>> {
        let drained: Vec<Arc<Client>> = {
            let mut clients = self.clients.write();
            clients.drain().map(|(_, client)| client).collect()
        };
        let mut ids = self.ids.lock();
        for client in &drained {
            ids.free_id(client.id());
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Ids reserved, including connections still being approved.
    pub fn ids_in_use(&self) -> usize {
        self.ids.lock().in_use()
    }

    pub fn max_clients(&self) -> usize {
        self.ids.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::detached_client;

    fn register(manager: &ClientManager) -> Arc<Client> {
        let id = manager.reserve_id().unwrap();
        let client = detached_client(id.get());
        assert!(manager.insert(Arc::clone(&client)));
        client
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.max_clients(), 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_multiple_clients() {
        let manager = ClientManager::new(3);
        let first = register(&manager);
        let second = register(&manager);

        assert_eq!(first.id().get(), 1);
        assert_eq!(second.id().get(), 2);
        assert_eq!(manager.len(), 2);
        assert!(manager.get(first.id()).is_some());
    }

    #[test]
    fn test_reserve_at_capacity() {
        let manager = ClientManager::new(1);
        register(&manager);
        assert!(manager.reserve_id().is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_frees_id() {
        let manager = ClientManager::new(1);
        let client = register(&manager);

        assert!(manager.remove(&client));
        assert!(manager.is_empty());
        assert_eq!(manager.reserve_id(), Some(client.id()));
    }

    #[test]
    fn test_remove_ignores_stale_instance() {
        let manager = ClientManager::new(2);
        let client = register(&manager);
        let impostor = detached_client(client.id().get());

        assert!(!manager.remove(&impostor));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.ids_in_use(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let manager = ClientManager::new(2);
        let client = register(&manager);
        assert!(!manager.insert(detached_client(client.id().get())));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_release_unregistered_id() {
        let manager = ClientManager::new(1);
        let id = manager.reserve_id().unwrap();
        assert_eq!(manager.ids_in_use(), 1);

        manager.release_id(id);
        assert_eq!(manager.ids_in_use(), 0);
    }

    #[test]
    fn test_release_registered_id_refused() {
        let manager = ClientManager::new(1);
        let client = register(&manager);
        manager.release_id(client.id());
        assert_eq!(manager.ids_in_use(), 1);
    }

    #[test]
    fn test_clear_frees_everything() {
        let manager = ClientManager::new(3);
        register(&manager);
        register(&manager);

        let drained = manager.clear();
        assert_eq!(drained.len(), 2);
        assert!(manager.is_empty());
        assert_eq!(manager.ids_in_use(), 0);
    }
}
