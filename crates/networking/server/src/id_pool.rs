use std::collections::VecDeque;

use relay_shared::ConnectionId;

/// Hands out connection ids for remote peers.
///
/// Freed ids are reused first-in first-out before a new, higher id is issued.
/// [`ConnectionId::LOCAL_CLIENT`] is never returned.
#[derive(Debug, Default)]
pub struct ConnectionIdPool {
    next: u16,
    recycled: VecDeque<ConnectionId>,
}

impl ConnectionIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every issued and recycled id; the next allocation yields `0` again.
    pub fn reset(&mut self) {
        self.next = 0;
        self.recycled.clear();
    }

    /// Returns `None` once the id space below the local client id is exhausted.
    pub fn allocate(&mut self) -> Option<ConnectionId> {
        if let Some(id) = self.recycled.pop_front() {
            return Some(id);
        }
        if self.next >= ConnectionId::LOCAL_CLIENT.get() {
            return None;
        }
        let id = ConnectionId::new(self.next);
        self.next += 1;
        Some(id)
    }

    pub fn release(&mut self, id: ConnectionId) {
        if id.is_local_client() || id.get() >= self.next || self.recycled.contains(&id) {
            tracing::warn!("ignoring release of connection id {id} that was not handed out");
            return;
        }
        self.recycled.push_back(id);
    }

    /// Puts back an id that was allocated but never handed to a connection,
    /// so it is the next one issued again.
    pub fn restore(&mut self, id: ConnectionId) {
        if id.is_local_client() || id.get() >= self.next || self.recycled.contains(&id) {
            tracing::warn!("ignoring restore of connection id {id} that was not handed out");
            return;
        }
        self.recycled.push_front(id);
    }

    #[cfg(test)]
    fn recycled_len(&self) -> usize {
        self.recycled.len()
    }
}
