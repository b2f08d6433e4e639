//! Server-seitiger Socket-Layer.
//!
//! Multiplexes remote peers of a relay/P2P transport and one in-process client host
//! behind a single [`ServerSocket`]. Peers get a small [`relay_shared::ConnectionId`];
//! the client host always uses [`relay_shared::ConnectionId::LOCAL_CLIENT`].
//!
//! Module overview:
//! - transport: the capability trait the socket drives, plus an in-memory implementation
//! - server_socket: lifecycle, admission, send/receive multiplexing
//! - client_host: the in-process client and its lock-free link to the server
//! - peer_table / id_pool: connection bookkeeping

pub mod client_host;
pub mod error;
pub mod id_pool;
pub mod peer_table;
pub mod server_socket;
pub mod transport;

pub use client_host::{ClientHostSocket, LocalClientBridge};
pub use error::{ClientHostError, ServerSocketError};
pub use id_pool::ConnectionIdPool;
pub use peer_table::{PeerTable, PeerTableError};
pub use server_socket::{
    ServerSocket, REASON_DISCONNECTED, REASON_MAX_CONNECTIONS, REASON_SERVER_STOPPING,
};
pub use transport::{
    ConnectionStatusChanged, ListenTarget, MemoryNetwork, MemoryPeerHandle, MemoryTransport,
    PeerConnectionState, PeerTransport, ReceivedMessage, SendResult, SentMessage,
    StatusSubscription,
};
