use bytes::Bytes;
use thiserror::Error;

use crate::{channels::ChannelId, ids::ConnectionId};

/// Lifecycle of a local socket (the listening server socket or the client host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LocalConnectionState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl LocalConnectionState {
    /// `true` for `Stopped` and `Stopping`.
    pub const fn is_inactive(self) -> bool {
        matches!(self, Self::Stopped | Self::Stopping)
    }
}

/// State of a remote connection as seen by the upper layer.
///
/// Remote peers are either fully established or gone; intermediate
/// transport states are not observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteConnectionState {
    Stopped,
    Started,
}

/// Generic transport level error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not create listen socket: {0}")]
    ListenFailed(String),
    #[error("connection could not be accepted: {0}")]
    AcceptFailed(String),
    #[error("unknown peer handle")]
    UnknownPeer,
}

/// Events raised by a server socket towards the upper protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listening socket changed its lifecycle state.
    LocalConnectionState(LocalConnectionState),
    /// A remote (or the local host) client was started or stopped.
    RemoteConnectionState {
        connection_id: ConnectionId,
        state: RemoteConnectionState,
    },
    /// A message arrived from a client.
    DataReceived {
        connection_id: ConnectionId,
        channel: ChannelId,
        payload: Bytes,
    },
}

/// Events raised by the in-process client host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionState(LocalConnectionState),
    DataReceived { channel: ChannelId, payload: Bytes },
}
