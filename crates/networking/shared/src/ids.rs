//! Streng typisierte Bezeichner für Verbindungen und entfernte Peers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one logical connection (local or remote) towards the upper protocol layer.
///
/// Remote connections receive small, recycled values starting at `0`. The value
/// [`ConnectionId::LOCAL_CLIENT`] is reserved for the client hosted in the same
/// process and is never handed out to a remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u16);

impl ConnectionId {
    /// Reserved id of the in-process client host.
    pub const LOCAL_CLIENT: ConnectionId = ConnectionId(i16::MAX as u16);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_local_client(self) -> bool {
        self.0 == Self::LOCAL_CLIENT.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upper bound for the number of remote clients a server socket may hold.
///
/// One below the local client id, so an allocated remote id can never collide with it.
pub const MAX_REMOTE_CLIENTS: u32 = ConnectionId::LOCAL_CLIENT.get() as u32 - 1;

/// Durable, transport-assigned identity of a remote endpoint (e.g. a 64-bit account id).
///
/// Stable across sessions, unlike the transport's per-connection handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity(u64);

impl PeerIdentity {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerIdentity {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
