//! Bidirectional lookup between transport handles, peer identities and connection ids.

use std::{collections::HashMap, hash::Hash};

use relay_shared::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerTableError {
    #[error("connection id {0} is already mapped")]
    IdInUse(ConnectionId),
    #[error("peer handle is already mapped to connection id {0}")]
    HandleInUse(ConnectionId),
    #[error("peer identity is already mapped to connection id {0}")]
    IdentityInUse(ConnectionId),
}

/// One-to-one map between `K` and [`ConnectionId`].
#[derive(Debug)]
struct BiMap<K> {
    by_key: HashMap<K, ConnectionId>,
    by_id: HashMap<ConnectionId, K>,
}

impl<K: Copy + Eq + Hash> BiMap<K> {
    fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K, id: ConnectionId) {
        self.by_key.insert(key, id);
        self.by_id.insert(id, key);
    }

    fn remove(&mut self, id: ConnectionId) -> Option<K> {
        let key = self.by_id.remove(&id)?;
        self.by_key.remove(&key);
        Some(key)
    }
}

/// Tracks every established remote connection.
///
/// Holds two synchronized one-to-one mappings: `handle <-> id` and
/// `identity <-> id`. Entries are only ever inserted and removed as a pair, so a
/// connection id is present in the handle map iff it is present in the identity map.
#[derive(Debug)]
pub struct PeerTable<H, I> {
    handles: BiMap<H>,
    identities: BiMap<I>,
}

impl<H, I> PeerTable<H, I>
where
    H: Copy + Eq + Hash,
    I: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            handles: BiMap::new(),
            identities: BiMap::new(),
        }
    }

    /// Maps `handle` and `identity` to `id`. Nothing is inserted if any of the three is taken.
    pub fn insert(
        &mut self,
        handle: H,
        identity: I,
        id: ConnectionId,
    ) -> Result<(), PeerTableError> {
        if self.handles.by_id.contains_key(&id) {
            return Err(PeerTableError::IdInUse(id));
        }
        if let Some(existing) = self.handles.by_key.get(&handle) {
            return Err(PeerTableError::HandleInUse(*existing));
        }
        if let Some(existing) = self.identities.by_key.get(&identity) {
            return Err(PeerTableError::IdentityInUse(*existing));
        }

        self.handles.insert(handle, id);
        self.identities.insert(identity, id);
        Ok(())
    }

    /// Removes both entries of `id`, returning what it was mapped to.
    pub fn remove(&mut self, id: ConnectionId) -> Option<(H, I)> {
        let handle = self.handles.remove(id)?;
        let identity = self.identities.remove(id)?;
        Some((handle, identity))
    }

    pub fn handle(&self, id: ConnectionId) -> Option<H> {
        self.handles.by_id.get(&id).copied()
    }

    pub fn identity(&self, id: ConnectionId) -> Option<I> {
        self.identities.by_id.get(&id).copied()
    }

    pub fn connection_id(&self, handle: &H) -> Option<ConnectionId> {
        self.handles.by_key.get(handle).copied()
    }

    pub fn connection_id_by_identity(&self, identity: &I) -> Option<ConnectionId> {
        self.identities.by_key.get(identity).copied()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handles.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.by_id.len()
    }

    /// Iterates `(handle, id)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (H, ConnectionId)> + '_ {
        self.handles.by_key.iter().map(|(handle, id)| (*handle, *id))
    }
}

impl<H, I> Default for PeerTable<H, I>
where
    H: Copy + Eq + Hash,
    I: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
