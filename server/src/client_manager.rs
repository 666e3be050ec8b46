//! Registry of connected clients.
//!
//! Shared between the accept/receive tasks and the tick loop as
//! `Arc<RwLock<ClientManager>>`; the receive path takes read locks to find
//! a connection, the accept and disconnect paths take write locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::client::ClientConnection;

#[derive(Debug)]
pub struct ClientManager {
    clients: HashMap<u32, Arc<ClientConnection>>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    pub fn allocate_client_id(&mut self) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }
        let id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
        Some(id)
    }

    pub fn add_client(&mut self, client: Arc<ClientConnection>) {
        info!("Client {} connected from {}", client.id, client.addr);
        self.clients.insert(client.id, client);
    }

    pub fn remove_client(&mut self, client_id: u32) -> Option<Arc<ClientConnection>> {
        let removed = self.clients.remove(&client_id);
        if removed.is_some() {
            info!("Client {} removed", client_id);
        }
        removed
    }

    pub fn get_client(&self, client_id: u32) -> Option<Arc<ClientConnection>> {
        self.clients.get(&client_id).cloned()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<ClientConnection>> {
        self.clients.values()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns the ids of clients that have gone silent past the timeout.
    pub fn timed_out_clients(&self, timeout: Duration) -> Vec<u32> {
        self.clients
            .values()
            .filter(|c| c.is_timed_out(timeout))
            .map(|c| c.id)
            .collect()
    }
}
