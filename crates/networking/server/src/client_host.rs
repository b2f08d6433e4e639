//! Client hosted in the same process as the server.
//!
//! Traffic between the server socket and this client never reaches the transport.
//! Each side owns a lock-free inbound queue the other side pushes into:
//!
//! - [`LocalLink`] lives in the server socket. It holds the packets sent by the
//!   client host and the flags the client needs to decide whether sending is allowed.
//! - [`LocalClientBridge`] is the client's shared half. The server keeps a clone of
//!   it while the client host is registered and pushes packets for
//!   [`ConnectionId::LOCAL_CLIENT`] into it.
//!
//! To the upper layer the local client looks like any remote connection, only with
//! the reserved id.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use relay_shared::{
    ChannelId, ClientEvent, ConnectionId, LocalConnectionState, LocalPacket, LocalPacketQueue,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::{
    error::ClientHostError,
    server_socket::{emit, ServerSocket},
    transport::PeerTransport,
};

/// Server-owned end of the in-process link.
#[derive(Debug, Default)]
pub(crate) struct LocalLink {
    incoming: LocalPacketQueue,
    client_started: AtomicBool,
    server_started: AtomicBool,
}

impl LocalLink {
    /// Queues a packet from the client host. Dropped if the local client is not started.
    pub(crate) fn received_from_local_client(&self, packet: LocalPacket) -> bool {
        if !self.client_started.load(Ordering::Acquire) {
            trace!("local client not started, dropping {} byte packet", packet.len());
            return false;
        }
        self.incoming.push(packet);
        true
    }

    pub(crate) fn incoming(&self) -> &LocalPacketQueue {
        &self.incoming
    }

    pub(crate) fn set_client_started(&self, started: bool) {
        self.client_started.store(started, Ordering::Release);
    }

    pub(crate) fn client_started(&self) -> bool {
        self.client_started.load(Ordering::Acquire)
    }

    pub(crate) fn set_server_started(&self, started: bool) {
        self.server_started.store(started, Ordering::Release);
    }

    fn server_started(&self) -> bool {
        self.server_started.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct BridgeShared {
    state: Mutex<LocalConnectionState>,
    incoming: LocalPacketQueue,
    events: UnboundedSender<ClientEvent>,
}

/// Handle to a client host that a server socket can register.
#[derive(Debug, Clone)]
pub struct LocalClientBridge {
    shared: Arc<BridgeShared>,
}

impl LocalClientBridge {
    fn new(events: UnboundedSender<ClientEvent>) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                state: Mutex::new(LocalConnectionState::Stopped),
                incoming: LocalPacketQueue::new(),
                events,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalConnectionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LocalConnectionState {
        *self.lock_state()
    }

    /// `true` if both handles point at the same client host.
    pub fn is(&self, other: &LocalClientBridge) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn set_state(&self, current: &mut LocalConnectionState, next: LocalConnectionState) {
        if *current == next {
            return;
        }
        *current = next;
        emit(&self.shared.events, ClientEvent::ConnectionState(next));
    }

    fn start(&self) -> Result<(), ClientHostError> {
        let mut state = self.lock_state();
        if *state != LocalConnectionState::Stopped {
            return Err(ClientHostError::AlreadyActive(*state));
        }
        self.set_state(&mut state, LocalConnectionState::Starting);
        self.set_state(&mut state, LocalConnectionState::Started);
        Ok(())
    }

    /// Stops the client side of the link. Returns `false` if it was not running.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.lock_state();
        if state.is_inactive() {
            return false;
        }
        let dropped = self.shared.incoming.clear();
        if dropped > 0 {
            debug!("client host discarded {dropped} undelivered packets");
        }
        self.set_state(&mut state, LocalConnectionState::Stopping);
        self.set_state(&mut state, LocalConnectionState::Stopped);
        true
    }

    /// Queues a packet sent by the server. Dropped unless the client host is started.
    pub(crate) fn received_from_local_server(&self, packet: LocalPacket) {
        if self.state() != LocalConnectionState::Started {
            trace!("client host not started, dropping {} byte packet", packet.len());
            return;
        }
        self.shared.incoming.push(packet);
    }
}

/// A client running inside the server's process.
#[derive(Debug)]
pub struct ClientHostSocket {
    bridge: LocalClientBridge,
    server: Option<Arc<LocalLink>>,
}

impl ClientHostSocket {
    pub fn new(events: UnboundedSender<ClientEvent>) -> Self {
        Self {
            bridge: LocalClientBridge::new(events),
            server: None,
        }
    }

    pub fn bridge(&self) -> LocalClientBridge {
        self.bridge.clone()
    }

    pub fn local_connection_state(&self) -> LocalConnectionState {
        self.bridge.state()
    }

    /// Connects to `server`, which must already be started.
    pub fn start_connection<T: PeerTransport>(
        &mut self,
        server: &mut ServerSocket<T>,
    ) -> Result<(), ClientHostError> {
        let state = self.bridge.state();
        if state != LocalConnectionState::Stopped {
            return Err(ClientHostError::AlreadyActive(state));
        }

        server.set_client_host(Some(self.bridge.clone()));
        if server.local_connection_state() != LocalConnectionState::Started {
            server.set_client_host(None);
            return Err(ClientHostError::ServerNotStarted);
        }

        self.bridge.start()?;
        self.server = Some(server.local_link());
        server.on_local_client_state(true);
        Ok(())
    }

    pub fn stop_connection<T: PeerTransport>(
        &mut self,
        server: &mut ServerSocket<T>,
    ) -> Result<(), ClientHostError> {
        if !self.bridge.stop() {
            return Err(ClientHostError::NotActive);
        }
        self.server = None;
        server.detach_client_host(&self.bridge);
        Ok(())
    }

    /// Sends to the server without touching the transport.
    ///
    /// Silently does nothing unless both sides are started.
    pub fn send_to_server(&self, channel: ChannelId, payload: &[u8]) {
        if self.bridge.state() != LocalConnectionState::Started {
            return;
        }
        let Some(link) = &self.server else {
            return;
        };
        if !link.server_started() {
            return;
        }
        link.received_from_local_client(LocalPacket::copy_from_slice(channel, payload));
    }

    /// Raises a `DataReceived` event for every packet the server sent since the last call.
    pub fn iterate_incoming(&mut self) {
        if self.bridge.state() != LocalConnectionState::Started {
            return;
        }
        for packet in self.bridge.shared.incoming.drain() {
            emit(
                &self.bridge.shared.events,
                ClientEvent::DataReceived {
                    channel: packet.channel,
                    payload: packet.payload,
                },
            );
        }
    }

    /// Connection id the server uses for this client.
    pub const fn connection_id(&self) -> ConnectionId {
        ConnectionId::LOCAL_CLIENT
    }
}
