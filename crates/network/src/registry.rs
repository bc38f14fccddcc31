//! Registered sessions keyed by [`ConnectionId`].
//!
//! The registry itself is a plain map; the server keeps it behind one lock
//! together with the event emission so eviction, insertion and their
//! notifications are observed as a single step.

use devlink_types::{ClientSnapshot, ConnectionId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::session::PeerSession;
use crate::transport::PeerConnection;

#[derive(Clone)]
pub struct RegistryEntry {
    pub session: Arc<dyn PeerSession>,
    /// `None` for sessions attached without a transport.
    pub connection: Option<PeerConnection>,
}

impl RegistryEntry {
    pub fn new(session: Arc<dyn PeerSession>, connection: Option<PeerConnection>) -> Self {
        Self {
            session,
            connection,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        self.session.id()
    }

    fn owned_by(&self, serial: u64) -> bool {
        self.connection.as_ref().map(|c| c.serial()) == Some(serial)
    }

    /// Close the session and its transport.
    pub fn close(&self) {
        self.session.close();
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id().clone(),
            query: self.session.query().clone(),
            plugins: self.session.plugins(),
            connected_at: self.session.connected_at(),
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnectionId, RegistryEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, returning whatever was registered under its id before.
    pub fn insert(&mut self, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(entry.id().clone(), entry)
    }

    /// Remove `id` only if it is still held by the connection with `serial`.
    pub fn remove_if_owned(&mut self, id: &ConnectionId, serial: u64) -> Option<RegistryEntry> {
        if self.entries.get(id)?.owned_by(serial) {
            self.entries.remove(id)
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> Vec<RegistryEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot ordered by id.
    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let mut clients: Vec<ClientSnapshot> =
            self.entries.values().map(RegistryEntry::snapshot).collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }
}
