//! In-memory session registry.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use crate::errors::SessionError;

/// Maps session identifiers to their live transports.
///
/// Insertion is insert-if-absent so a live entry is never overwritten, and
/// every key equals the identifier it was registered under.
pub struct SessionRegistry<T> {
    sessions: DashMap<String, Arc<T>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn create(&self, id: &str, transport: Arc<T>) -> Result<(), SessionError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::DuplicateSession(id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(transport);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes `id` if present. Returns whether an entry was removed.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Removes every entry and returns the transports, for shutdown.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, transport)| transport))
            .collect()
    }
}
