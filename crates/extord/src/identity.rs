use crate::error::IdentityError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use extor_common::ExtOrId;
use std::net::SocketAddr;
use std::time::Instant;

/// Handle stored in the identity map for an authenticated connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnHandle {
    /// Per-process connection serial, unique for the daemon's lifetime.
    pub serial: u64,
    /// Address of the transport process's socket.
    pub peer_addr: SocketAddr,
    /// Instant the identifier was registered.
    pub registered_at: Instant,
}

/// Concurrent identifier → connection table.
///
/// Each identifier maps to at most one live connection. Operations lock a
/// single shard briefly and never perform I/O.
#[derive(Debug)]
pub struct IdentityMap<H = ConnHandle> {
    entries: DashMap<ExtOrId, H>,
}

impl<H> IdentityMap<H> {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Associates `id` with `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::DuplicateId`] if `id` is already present; the
    /// existing mapping is left untouched.
    pub fn register(&self, id: ExtOrId, handle: H) -> Result<(), IdentityError> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(IdentityError::DuplicateId),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Removes and returns the handle mapped to `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] if nothing is mapped to `id`.
    pub fn claim(&self, id: &ExtOrId) -> Result<H, IdentityError> {
        self.entries
            .remove(id)
            .map(|(_, handle)| handle)
            .ok_or(IdentityError::NotFound)
    }

    /// Removes `id` if present. Safe to call more than once.
    pub fn remove(&self, id: &ExtOrId) {
        self.entries.remove(id);
    }

    /// Removes `id` only if its handle satisfies `owned`.
    ///
    /// Teardown uses this so a closing connection never removes an entry
    /// that was since claimed and re-registered by another connection.
    pub fn remove_if(&self, id: &ExtOrId, owned: impl FnOnce(&H) -> bool) {
        self.entries.remove_if(id, |_k, v| owned(v));
    }

    /// Returns `true` if `id` is currently mapped.
    #[must_use]
    pub fn contains(&self, id: &ExtOrId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<H> Default for IdentityMap<H> {
    fn default() -> Self {
        Self::new()
    }
}
