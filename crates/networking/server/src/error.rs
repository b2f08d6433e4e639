use relay_shared::{ConnectionId, LocalConnectionState, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerSocketError {
    #[error("could not parse address '{0}'")]
    InvalidAddress(String),
    #[error("server socket is already {0:?}")]
    AlreadyActive(LocalConnectionState),
    #[error("server socket is already stopped")]
    AlreadyStopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no connection found for connection id {0}")]
    UnknownConnection(ConnectionId),
    #[error("no local client host is registered")]
    NoClientHost,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientHostError {
    #[error("client host is already {0:?}")]
    AlreadyActive(LocalConnectionState),
    #[error("server socket is not started")]
    ServerNotStarted,
    #[error("client host is not running")]
    NotActive,
}
