//! Transport capability consumed by the server socket.
//!
//! The server socket never talks to a concrete network library. Everything it
//! needs (listen sockets, accepting, sending, batched receive, flushing and the
//! stream of per-connection state changes) goes through [`PeerTransport`]. One
//! implementation is chosen when the socket is constructed.

use std::{
    fmt::{Debug, Display},
    hash::Hash,
    net::SocketAddr,
};

use bytes::Bytes;
use relay_shared::{ChannelId, TransportError};
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};

pub mod memory;

pub use memory::{MemoryNetwork, MemoryPeerHandle, MemoryTransport, SentMessage};

/// Where a listen socket should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenTarget {
    /// Listen on the relay network; peers reach us through their durable identity.
    PeerToPeer { virtual_port: u16 },
    /// Listen on a direct IP socket.
    Ip(SocketAddr),
}

/// Outcome of a transport send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    /// The connection is gone on the transport side.
    NoConnection,
    /// The handle is no longer valid.
    InvalidParam,
    /// Any other failure; assumed transient.
    Other(i32),
}

impl SendResult {
    /// `true` for results that mean the peer is lost.
    pub const fn is_connection_lost(self) -> bool {
        matches!(self, SendResult::NoConnection | SendResult::InvalidParam)
    }
}

/// Transport-level state of a single remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
    Other,
}

/// Asynchronous notification that a remote connection changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusChanged<H, I> {
    pub handle: H,
    pub identity: I,
    pub state: PeerConnectionState,
}

/// A message pulled from a remote connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub channel: ChannelId,
    pub payload: Bytes,
}

/// Registration for connection status notifications.
///
/// Dropping it unregisters the handler: the transport sees its sender closed and
/// stops delivering.
#[derive(Debug)]
pub struct StatusSubscription<H, I> {
    receiver: UnboundedReceiver<ConnectionStatusChanged<H, I>>,
}

impl<H, I> StatusSubscription<H, I> {
    pub fn new(receiver: UnboundedReceiver<ConnectionStatusChanged<H, I>>) -> Self {
        Self { receiver }
    }

    /// Next queued notification, if any. Never blocks.
    pub fn try_next(&mut self) -> Option<ConnectionStatusChanged<H, I>> {
        match self.receiver.try_recv() {
            Ok(change) => Some(change),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// Common interface implemented by server-side peer transports.
///
/// All calls are non-blocking.
pub trait PeerTransport: Debug {
    /// Per-connection token; only valid while the transport connection is open.
    type Handle: Copy + Eq + Hash + Debug;
    /// Durable identity of the remote endpoint.
    type Identity: Copy + Eq + Hash + Debug + Display;
    type ListenSocket: Debug;

    fn create_listen_socket(
        &mut self,
        target: ListenTarget,
    ) -> Result<Self::ListenSocket, TransportError>;

    fn close_listen_socket(&mut self, socket: Self::ListenSocket);

    /// Registers for connection status notifications.
    fn subscribe_status(&mut self) -> StatusSubscription<Self::Handle, Self::Identity>;

    fn accept_connection(&mut self, peer: Self::Handle) -> Result<(), TransportError>;

    fn close_connection(&mut self, peer: Self::Handle, reason: &str);

    fn send(&mut self, peer: Self::Handle, payload: &[u8], channel: ChannelId) -> SendResult;

    /// Appends up to `max` pending messages of `peer` to `out`, returning how many were added.
    fn receive_batch(
        &mut self,
        peer: Self::Handle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> usize;

    /// Pushes any buffered outbound data of `peer` onto the wire.
    fn flush(&mut self, peer: Self::Handle);
}
