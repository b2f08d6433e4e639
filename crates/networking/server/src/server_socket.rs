//! Listening server socket.
//!
//! Accepts remote peers through a [`PeerTransport`], assigns each a small
//! [`ConnectionId`], and multiplexes them with the in-process client host into one
//! stream of [`ServerEvent`]s. Driven by a single network thread:
//! [`ServerSocket::iterate_incoming`] and [`ServerSocket::iterate_outgoing`] once per
//! tick. Transport status notifications are queued by the transport and handled at
//! the start of every incoming iteration, so all table mutation happens on that thread.

use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use relay_shared::{
    ChannelId, ConnectionId, LocalConnectionState, LocalPacket, RemoteConnectionState,
    ServerEvent, ServerSocketConfig, MAX_MESSAGES_PER_POLL, MAX_REMOTE_CLIENTS,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::{
    client_host::{LocalClientBridge, LocalLink},
    error::ServerSocketError,
    id_pool::ConnectionIdPool,
    peer_table::PeerTable,
    transport::{
        ConnectionStatusChanged, ListenTarget, PeerConnectionState, PeerTransport,
        ReceivedMessage, SendResult, StatusSubscription,
    },
};

/// Close reason for connections rejected at capacity.
pub const REASON_MAX_CONNECTIONS: &str = "Max Connection Count";
/// Close reason for connections still open when the socket stops.
pub const REASON_SERVER_STOPPING: &str = "Server Stopping";
/// Close reason for every other disconnect.
pub const REASON_DISCONNECTED: &str = "Disconnected";

/// Relay listen sockets always use virtual port 0; the configured port only applies to IP mode.
const P2P_VIRTUAL_PORT: u16 = 0;

pub struct ServerSocket<T: PeerTransport> {
    transport: T,
    events: UnboundedSender<ServerEvent>,
    state: LocalConnectionState,
    peer_to_peer: bool,
    listen_socket: Option<T::ListenSocket>,
    status: Option<StatusSubscription<T::Handle, T::Identity>>,
    peers: PeerTable<T::Handle, T::Identity>,
    /// Accepted by us, `Connected` not yet reported. Counts against capacity.
    pending: HashSet<T::Handle>,
    ids: ConnectionIdPool,
    maximum_clients: u32,
    receive_batch_size: usize,
    local: Arc<LocalLink>,
    client_host: Option<LocalClientBridge>,
    inbound: Vec<ReceivedMessage>,
}

impl<T: PeerTransport> ServerSocket<T> {
    pub fn new(transport: T, events: UnboundedSender<ServerEvent>) -> Self {
        Self {
            transport,
            events,
            state: LocalConnectionState::Stopped,
            peer_to_peer: false,
            listen_socket: None,
            status: None,
            peers: PeerTable::new(),
            pending: HashSet::new(),
            ids: ConnectionIdPool::new(),
            maximum_clients: MAX_REMOTE_CLIENTS,
            receive_batch_size: MAX_MESSAGES_PER_POLL,
            local: Arc::new(LocalLink::default()),
            client_host: None,
            inbound: Vec::with_capacity(MAX_MESSAGES_PER_POLL),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn local_connection_state(&self) -> LocalConnectionState {
        self.state
    }

    pub fn is_peer_to_peer(&self) -> bool {
        self.peer_to_peer
    }

    pub fn receive_batch_size(&self) -> usize {
        self.receive_batch_size
    }

    pub fn set_receive_batch_size(&mut self, size: usize) {
        self.receive_batch_size = size.max(1);
    }

    /// Number of established remote connections.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    // ---------------------------------------------------------------------------------------------
    // Socket lifecycle
    // ---------------------------------------------------------------------------------------------

    /// Opens the listen socket.
    ///
    /// `address` is only used when not `peer_to_peer`; an empty address listens on
    /// every interface. On failure the socket ends up `Stopped` and the caller has
    /// to call `start` again.
    pub fn start(
        &mut self,
        address: &str,
        port: u16,
        maximum_clients: u32,
        peer_to_peer: bool,
    ) -> Result<(), ServerSocketError> {
        if self.state != LocalConnectionState::Stopped {
            warn!("server socket start requested while {:?}", self.state);
            return Err(ServerSocketError::AlreadyActive(self.state));
        }

        let target = if peer_to_peer {
            ListenTarget::PeerToPeer {
                virtual_port: P2P_VIRTUAL_PORT,
            }
        } else {
            match parse_bind_address(address, port) {
                Ok(addr) => ListenTarget::Ip(addr),
                Err(err) => {
                    error!("{err}");
                    self.set_local_state(LocalConnectionState::Stopped);
                    return Err(err);
                }
            }
        };

        self.peer_to_peer = peer_to_peer;
        self.set_maximum_clients(maximum_clients);
        self.ids.reset();
        self.pending.clear();

        self.set_local_state(LocalConnectionState::Starting);
        self.status = Some(self.transport.subscribe_status());

        match self.transport.create_listen_socket(target) {
            Ok(socket) => {
                self.listen_socket = Some(socket);
                self.set_local_state(LocalConnectionState::Started);
                info!(
                    "server socket listening ({:?}, max clients {})",
                    target, self.maximum_clients
                );
                Ok(())
            }
            Err(err) => {
                error!("could not open listen socket: {err}");
                self.status = None;
                self.set_local_state(LocalConnectionState::Stopped);
                Err(err.into())
            }
        }
    }

    pub fn start_with_config(
        &mut self,
        config: &ServerSocketConfig,
    ) -> Result<(), ServerSocketError> {
        self.set_receive_batch_size(config.receive_batch_size);
        self.start(
            &config.address,
            config.port,
            config.maximum_clients,
            config.peer_to_peer,
        )
    }

    /// Closes the listen socket and every remaining remote connection.
    pub fn stop(&mut self) -> Result<(), ServerSocketError> {
        if self.state == LocalConnectionState::Stopped {
            return Err(ServerSocketError::AlreadyStopped);
        }

        self.set_local_state(LocalConnectionState::Stopping);

        let open: Vec<(T::Handle, ConnectionId)> = self.peers.iter().collect();
        for (handle, id) in open {
            self.teardown(id, handle, REASON_SERVER_STOPPING);
        }
        for handle in self.pending.drain() {
            self.transport.close_connection(handle, REASON_SERVER_STOPPING);
        }
        if let Some(socket) = self.listen_socket.take() {
            self.transport.close_listen_socket(socket);
        }
        self.status = None;
        self.local.incoming().clear();

        self.set_local_state(LocalConnectionState::Stopped);
        info!("server socket stopped");
        Ok(())
    }

    /// Forces the state to `Stopped` if no listen socket is held.
    pub fn reset_invalid_socket(&mut self) {
        if self.listen_socket.is_none() && self.state != LocalConnectionState::Stopped {
            warn!("server socket {:?} without listen socket, resetting", self.state);
            self.status = None;
            self.set_local_state(LocalConnectionState::Stopped);
        }
    }

    fn set_local_state(&mut self, state: LocalConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.local
            .set_server_started(state == LocalConnectionState::Started);
        debug!("server socket state -> {:?}", state);
        self.emit(ServerEvent::LocalConnectionState(state));
    }

    fn emit(&self, event: ServerEvent) {
        emit(&self.events, event);
    }

    // ---------------------------------------------------------------------------------------------
    // Remote connections
    // ---------------------------------------------------------------------------------------------

    /// Disconnects a client. For [`ConnectionId::LOCAL_CLIENT`] the client host is stopped.
    pub fn stop_connection(&mut self, id: ConnectionId) -> Result<(), ServerSocketError> {
        if id.is_local_client() {
            return self.stop_local_client();
        }

        let Some(handle) = self.peers.handle(id) else {
            error!("connection not found for connection id {id}");
            return Err(ServerSocketError::UnknownConnection(id));
        };
        self.teardown(id, handle, REASON_DISCONNECTED);
        Ok(())
    }

    fn teardown(&mut self, id: ConnectionId, handle: T::Handle, reason: &str) {
        self.transport.close_connection(handle, reason);
        self.peers.remove(id);
        info!("client with connection id {id} disconnected");
        self.emit(ServerEvent::RemoteConnectionState {
            connection_id: id,
            state: RemoteConnectionState::Stopped,
        });
        self.ids.release(id);
    }

    /// Handles every status notification the transport queued since the last call.
    pub fn dispatch_status_changes(&mut self) {
        loop {
            let Some(change) = self.status.as_mut().and_then(StatusSubscription::try_next) else {
                break;
            };
            self.on_remote_connection_state(change);
        }
    }

    pub fn on_remote_connection_state(
        &mut self,
        change: ConnectionStatusChanged<T::Handle, T::Identity>,
    ) {
        let ConnectionStatusChanged {
            handle,
            identity,
            state,
        } = change;
        match state {
            PeerConnectionState::Connecting => self.on_connecting(handle, identity),
            PeerConnectionState::Connected => self.on_connected(handle, identity),
            PeerConnectionState::ClosedByPeer | PeerConnectionState::ProblemDetectedLocally => {
                self.on_closed(handle, identity)
            }
            other => info!("connection {identity} state changed: {other:?}"),
        }
    }

    fn open_connection_count(&self) -> usize {
        self.peers.len() + self.pending.len()
    }

    fn at_capacity(&self) -> bool {
        self.open_connection_count() >= self.maximum_clients as usize
    }

    fn on_connecting(&mut self, handle: T::Handle, identity: T::Identity) {
        if self.pending.contains(&handle) || self.peers.connection_id(&handle).is_some() {
            debug!("ignoring repeated connecting notification from {identity}");
            return;
        }
        if self.at_capacity() {
            info!("incoming connection {identity} would exceed max connection count, rejecting");
            self.transport.close_connection(handle, REASON_MAX_CONNECTIONS);
            return;
        }

        match self.transport.accept_connection(handle) {
            Ok(()) => {
                self.pending.insert(handle);
                info!("accepting connection {identity}");
            }
            Err(err) => info!("connection {identity} could not be accepted: {err}"),
        }
    }

    fn on_connected(&mut self, handle: T::Handle, identity: T::Identity) {
        if let Some(id) = self.peers.connection_id(&handle) {
            debug!("connection {identity} already has connection id {id}");
            return;
        }
        if !self.pending.remove(&handle) && self.at_capacity() {
            info!("unannounced connection {identity} would exceed max connection count, rejecting");
            self.transport.close_connection(handle, REASON_MAX_CONNECTIONS);
            return;
        }

        if let Some(existing) = self.peers.connection_id_by_identity(&identity) {
            warn!("{identity} is already connected as connection id {existing}, rejecting");
            self.transport.close_connection(handle, REASON_DISCONNECTED);
            return;
        }

        let Some(id) = self.ids.allocate() else {
            error!("no connection id left for {identity}");
            self.transport.close_connection(handle, REASON_MAX_CONNECTIONS);
            return;
        };
        if let Err(err) = self.peers.insert(handle, identity, id) {
            error!("could not register connection {identity}: {err}");
            self.ids.restore(id);
            self.transport.close_connection(handle, REASON_DISCONNECTED);
            return;
        }

        info!("client {identity} connected, assigning connection id {id}");
        self.emit(ServerEvent::RemoteConnectionState {
            connection_id: id,
            state: RemoteConnectionState::Started,
        });
    }

    fn on_closed(&mut self, handle: T::Handle, identity: T::Identity) {
        if self.pending.remove(&handle) {
            debug!("connection {identity} closed before it was established");
            self.transport.close_connection(handle, REASON_DISCONNECTED);
            return;
        }
        if let Some(id) = self.peers.connection_id(&handle) {
            self.teardown(id, handle, REASON_DISCONNECTED);
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Multiplexing
    // ---------------------------------------------------------------------------------------------

    /// Flushes buffered outbound data of every remote connection.
    pub fn iterate_outgoing(&mut self) {
        if self.state != LocalConnectionState::Started {
            return;
        }
        for (handle, _) in self.peers.iter() {
            self.transport.flush(handle);
        }
    }

    /// Raises events for everything received since the last tick.
    ///
    /// Status notifications are handled first, then every packet of the local client,
    /// then up to one receive batch per remote connection.
    pub fn iterate_incoming(&mut self) {
        if self.state.is_inactive() {
            return;
        }

        self.dispatch_status_changes();

        for packet in self.local.incoming().drain() {
            emit(
                &self.events,
                ServerEvent::DataReceived {
                    connection_id: ConnectionId::LOCAL_CLIENT,
                    channel: packet.channel,
                    payload: packet.payload,
                },
            );
        }

        let batch = self.receive_batch_size;
        for (handle, connection_id) in self.peers.iter() {
            self.transport.receive_batch(handle, batch, &mut self.inbound);
            for message in self.inbound.drain(..) {
                emit(
                    &self.events,
                    ServerEvent::DataReceived {
                        connection_id,
                        channel: message.channel,
                        payload: message.payload,
                    },
                );
            }
        }
    }

    /// Sends `payload` to a client.
    ///
    /// Only works while started. Sends to [`ConnectionId::LOCAL_CLIENT`] go straight to
    /// the client host. A send the transport rejects because the peer is gone tears the
    /// connection down; other send failures are logged and the connection is kept.
    pub fn send_to_client(&mut self, channel: ChannelId, payload: &[u8], id: ConnectionId) {
        if self.state != LocalConnectionState::Started {
            return;
        }

        if id.is_local_client() {
            if let Some(bridge) = &self.client_host {
                bridge.received_from_local_server(LocalPacket::copy_from_slice(channel, payload));
            }
            return;
        }

        let Some(handle) = self.peers.handle(id) else {
            error!("connection id {id} does not exist, data will not be sent");
            return;
        };

        match self.transport.send(handle, payload, channel) {
            SendResult::Ok => {}
            result if result.is_connection_lost() => {
                info!("connection to {id} was lost ({result:?})");
                self.teardown(id, handle, REASON_DISCONNECTED);
            }
            result => error!("could not send to connection id {id}: {result:?}"),
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------------------------------

    /// Remote clients are either `Started` or `Stopped`; in-between states are not visible.
    pub fn connection_state(&self, id: ConnectionId) -> RemoteConnectionState {
        if self.peers.contains(id) {
            RemoteConnectionState::Started
        } else {
            RemoteConnectionState::Stopped
        }
    }

    /// Durable identity of the peer behind `id`, or an empty string if `id` is unknown.
    pub fn connection_address(&self, id: ConnectionId) -> String {
        match self.peers.identity(id) {
            Some(identity) => identity.to_string(),
            None => {
                error!("connection id {id} is invalid; address cannot be returned");
                String::new()
            }
        }
    }

    /// Connection id currently assigned to `identity`.
    pub fn connection_id_of(&self, identity: &T::Identity) -> Option<ConnectionId> {
        self.peers.connection_id_by_identity(identity)
    }

    /// Existing clients stay connected if lowered below the current count.
    pub fn set_maximum_clients(&mut self, value: u32) {
        self.maximum_clients = value.min(MAX_REMOTE_CLIENTS);
    }

    pub fn maximum_clients(&self) -> u32 {
        self.maximum_clients
    }

    // ---------------------------------------------------------------------------------------------
    // Local client
    // ---------------------------------------------------------------------------------------------

    /// Registers (or with `None` removes) the client host.
    pub fn set_client_host(&mut self, bridge: Option<LocalClientBridge>) {
        self.client_host = bridge;
    }

    pub fn has_client_host(&self) -> bool {
        self.client_host.is_some()
    }

    /// Records whether the local client is connected and tells the upper layer.
    ///
    /// Packets still queued from the local client are discarded when it stops.
    pub fn on_local_client_state(&mut self, started: bool) {
        self.local.set_client_started(started);
        let state = if started {
            RemoteConnectionState::Started
        } else {
            let dropped = self.local.incoming().clear();
            if dropped > 0 {
                debug!("discarded {dropped} packets from stopped local client");
            }
            RemoteConnectionState::Stopped
        };
        self.emit(ServerEvent::RemoteConnectionState {
            connection_id: ConnectionId::LOCAL_CLIENT,
            state,
        });
    }

    /// Queues a packet from the local client; dropped if it is not started.
    pub fn received_from_local_client(&self, packet: LocalPacket) {
        self.local.received_from_local_client(packet);
    }

    pub fn is_local_client_started(&self) -> bool {
        self.local.client_started()
    }

    pub(crate) fn local_link(&self) -> Arc<LocalLink> {
        Arc::clone(&self.local)
    }

    fn stop_local_client(&mut self) -> Result<(), ServerSocketError> {
        let Some(bridge) = self.client_host.take() else {
            error!("no client host registered, cannot stop local client");
            return Err(ServerSocketError::NoClientHost);
        };
        bridge.stop();
        self.on_local_client_state(false);
        Ok(())
    }

    /// Called by a client host that stopped itself.
    pub(crate) fn detach_client_host(&mut self, bridge: &LocalClientBridge) {
        let registered = self
            .client_host
            .as_ref()
            .is_some_and(|current| current.is(bridge));
        if !registered {
            debug!("stopped client host was not registered with this server socket");
            return;
        }
        self.client_host = None;
        self.on_local_client_state(false);
    }
}

impl<T: PeerTransport> fmt::Debug for ServerSocket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("state", &self.state)
            .field("peer_to_peer", &self.peer_to_peer)
            .field("connections", &self.peers.len())
            .field("pending", &self.pending.len())
            .field("maximum_clients", &self.maximum_clients)
            .field("client_host", &self.client_host.is_some())
            .finish()
    }
}

impl<T: PeerTransport> Drop for ServerSocket<T> {
    fn drop(&mut self) {
        if self.state != LocalConnectionState::Stopped {
            let _ = self.stop();
        }
    }
}

/// Sends `event` to the upper layer; a dropped receiver only gets logged.
pub(crate) fn emit<E>(events: &UnboundedSender<E>, event: E) {
    if events.send(event).is_err() {
        debug!("event receiver dropped");
    }
}

/// Empty addresses bind every interface.
fn parse_bind_address(address: &str, port: u16) -> Result<SocketAddr, ServerSocketError> {
    let address = address.trim();
    if address.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
    }
    address
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ServerSocketError::InvalidAddress(address.to_owned()))
}
