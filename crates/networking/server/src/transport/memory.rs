//! In-memory peer transport.
//!
//! Simulates a relay network inside the current process. [`MemoryTransport`] is the
//! server-side half handed to a server socket; [`MemoryNetwork`] is a cloneable handle
//! that plays the remote side: it opens connections, delivers inbound messages,
//! drops peers and inspects what the server flushed. Used by the tests and the
//! demo host binary.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use relay_shared::{ChannelId, ChannelKind, PeerIdentity, TransportError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, trace};

use super::{
    ConnectionStatusChanged, ListenTarget, PeerConnectionState, PeerTransport, ReceivedMessage,
    SendResult, StatusSubscription,
};

/// Handle of one simulated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryPeerHandle(u32);

impl MemoryPeerHandle {
    pub const fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryListenSocket(u32);

/// A message the server sent to a simulated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: ChannelId,
    pub kind: ChannelKind,
    pub payload: Bytes,
}

type StatusSender = UnboundedSender<ConnectionStatusChanged<MemoryPeerHandle, PeerIdentity>>;

#[derive(Debug)]
struct SimulatedPeer {
    identity: PeerIdentity,
    open: bool,
    accepted: bool,
    refuse_accept: bool,
    forced_send_result: Option<SendResult>,
    inbound: VecDeque<ReceivedMessage>,
    buffered: Vec<SentMessage>,
    delivered: Vec<SentMessage>,
    close_reason: Option<String>,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_handle: u32,
    listen_target: Option<ListenTarget>,
    refuse_listen: Option<String>,
    status: Option<StatusSender>,
    peers: HashMap<MemoryPeerHandle, SimulatedPeer>,
    send_calls: usize,
}

impl NetworkState {
    fn notify(&mut self, handle: MemoryPeerHandle, state: PeerConnectionState) {
        let Some(identity) = self.peers.get(&handle).map(|peer| peer.identity) else {
            return;
        };
        let Some(sender) = &self.status else {
            trace!("no status subscriber for {:?} -> {:?}", handle, state);
            return;
        };
        let change = ConnectionStatusChanged {
            handle,
            identity,
            state,
        };
        if sender.send(change).is_err() {
            self.status = None;
        }
    }

    fn open_peer(&mut self, handle: MemoryPeerHandle) -> Option<&mut SimulatedPeer> {
        self.peers.get_mut(&handle).filter(|peer| peer.open)
    }
}

/// Remote side of the simulated network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a connection attempt from `identity`.
    ///
    /// Raises `Connecting` if a listen socket is open; otherwise the attempt is
    /// closed immediately and the returned handle is dead.
    pub fn connect(&self, identity: PeerIdentity) -> MemoryPeerHandle {
        let mut state = self.state();
        let handle = MemoryPeerHandle(state.next_handle);
        state.next_handle += 1;
        let listening = state.listen_target.is_some();
        state.peers.insert(
            handle,
            SimulatedPeer {
                identity,
                open: listening,
                accepted: false,
                refuse_accept: false,
                forced_send_result: None,
                inbound: VecDeque::new(),
                buffered: Vec::new(),
                delivered: Vec::new(),
                close_reason: None,
            },
        );
        if listening {
            state.notify(handle, PeerConnectionState::Connecting);
        } else {
            debug!("connection attempt from {identity} without listen socket");
        }
        handle
    }

    /// Makes the next `accept_connection` for `handle` fail.
    pub fn refuse_accept(&self, handle: MemoryPeerHandle) {
        if let Some(peer) = self.state().peers.get_mut(&handle) {
            peer.refuse_accept = true;
        }
    }

    /// Queues an inbound message from the peer. Returns `false` if the connection is closed.
    pub fn deliver(&self, handle: MemoryPeerHandle, channel: ChannelId, payload: &[u8]) -> bool {
        let mut state = self.state();
        let Some(peer) = state.open_peer(handle) else {
            return false;
        };
        peer.inbound.push_back(ReceivedMessage {
            channel,
            payload: Bytes::copy_from_slice(payload),
        });
        true
    }

    /// The peer hangs up.
    pub fn disconnect(&self, handle: MemoryPeerHandle) {
        self.close_remotely(handle, PeerConnectionState::ClosedByPeer);
    }

    /// The transport loses the peer on our side.
    pub fn report_problem(&self, handle: MemoryPeerHandle) {
        self.close_remotely(handle, PeerConnectionState::ProblemDetectedLocally);
    }

    fn close_remotely(&self, handle: MemoryPeerHandle, reason: PeerConnectionState) {
        let mut state = self.state();
        let Some(peer) = state.open_peer(handle) else {
            return;
        };
        peer.open = false;
        peer.inbound.clear();
        state.notify(handle, reason);
    }

    /// Raises an arbitrary notification without touching the peer.
    pub fn notify_state(&self, handle: MemoryPeerHandle, peer_state: PeerConnectionState) {
        self.state().notify(handle, peer_state);
    }

    /// Forces every following send to `handle` to return `result`; `None` restores normal sends.
    pub fn force_send_result(&self, handle: MemoryPeerHandle, result: Option<SendResult>) {
        if let Some(peer) = self.state().peers.get_mut(&handle) {
            peer.forced_send_result = result;
        }
    }

    /// Takes everything flushed to the peer so far.
    pub fn take_delivered(&self, handle: MemoryPeerHandle) -> Vec<SentMessage> {
        self.state()
            .peers
            .get_mut(&handle)
            .map(|peer| std::mem::take(&mut peer.delivered))
            .unwrap_or_default()
    }

    /// Messages sent but not yet flushed.
    pub fn buffered_len(&self, handle: MemoryPeerHandle) -> usize {
        self.state()
            .peers
            .get(&handle)
            .map_or(0, |peer| peer.buffered.len())
    }

    pub fn close_reason(&self, handle: MemoryPeerHandle) -> Option<String> {
        self.state()
            .peers
            .get(&handle)
            .and_then(|peer| peer.close_reason.clone())
    }

    pub fn is_open(&self, handle: MemoryPeerHandle) -> bool {
        self.state().peers.get(&handle).is_some_and(|peer| peer.open)
    }

    pub fn is_accepted(&self, handle: MemoryPeerHandle) -> bool {
        self.state()
            .peers
            .get(&handle)
            .is_some_and(|peer| peer.accepted)
    }

    /// Number of `send` calls the server made, successful or not.
    pub fn send_calls(&self) -> usize {
        self.state().send_calls
    }

    /// Makes listen socket creation fail with `reason`; `None` allows it again.
    pub fn refuse_listen(&self, reason: Option<String>) {
        self.state().refuse_listen = reason;
    }

    pub fn listen_target(&self) -> Option<ListenTarget> {
        self.state().listen_target
    }

    pub fn is_listening(&self) -> bool {
        self.state().listen_target.is_some()
    }

    /// `true` while a status subscription is alive.
    pub fn has_subscriber(&self) -> bool {
        self.state()
            .status
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }
}

/// Server-side half of the simulated network.
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    next_socket: u32,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            next_socket: 1,
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl PeerTransport for MemoryTransport {
    type Handle = MemoryPeerHandle;
    type Identity = PeerIdentity;
    type ListenSocket = MemoryListenSocket;

    fn create_listen_socket(
        &mut self,
        target: ListenTarget,
    ) -> Result<MemoryListenSocket, TransportError> {
        let mut state = self.network.state();
        if let Some(reason) = &state.refuse_listen {
            return Err(TransportError::ListenFailed(reason.clone()));
        }
        if state.listen_target.is_some() {
            return Err(TransportError::ListenFailed("already listening".into()));
        }
        state.listen_target = Some(target);
        let socket = MemoryListenSocket(self.next_socket);
        self.next_socket += 1;
        debug!("memory transport listening on {:?}", target);
        Ok(socket)
    }

    fn close_listen_socket(&mut self, socket: MemoryListenSocket) {
        let mut state = self.network.state();
        state.listen_target = None;
        for peer in state.peers.values_mut() {
            peer.open = false;
            peer.buffered.clear();
        }
        debug!("memory transport closed listen socket {:?}", socket);
    }

    fn subscribe_status(&mut self) -> StatusSubscription<MemoryPeerHandle, PeerIdentity> {
        let (sender, receiver) = unbounded_channel();
        self.network.state().status = Some(sender);
        StatusSubscription::new(receiver)
    }

    fn accept_connection(&mut self, peer: MemoryPeerHandle) -> Result<(), TransportError> {
        let mut state = self.network.state();
        let simulated = state.open_peer(peer).ok_or(TransportError::UnknownPeer)?;
        if simulated.refuse_accept {
            simulated.open = false;
            return Err(TransportError::AcceptFailed("refused by remote".into()));
        }
        simulated.accepted = true;
        state.notify(peer, PeerConnectionState::Connected);
        Ok(())
    }

    fn close_connection(&mut self, peer: MemoryPeerHandle, reason: &str) {
        if let Some(simulated) = self.network.state().peers.get_mut(&peer) {
            simulated.open = false;
            simulated.buffered.clear();
            simulated.close_reason = Some(reason.to_owned());
        }
    }

    fn send(&mut self, peer: MemoryPeerHandle, payload: &[u8], channel: ChannelId) -> SendResult {
        let mut state = self.network.state();
        state.send_calls += 1;
        let Some(simulated) = state.open_peer(peer) else {
            return SendResult::NoConnection;
        };
        if let Some(forced) = simulated.forced_send_result {
            return forced;
        }
        simulated.buffered.push(SentMessage {
            channel,
            kind: ChannelKind::of(channel),
            payload: Bytes::copy_from_slice(payload),
        });
        SendResult::Ok
    }

    fn receive_batch(
        &mut self,
        peer: MemoryPeerHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> usize {
        let mut state = self.network.state();
        let Some(simulated) = state.open_peer(peer) else {
            return 0;
        };
        let count = max.min(simulated.inbound.len());
        out.extend(simulated.inbound.drain(..count));
        count
    }

    fn flush(&mut self, peer: MemoryPeerHandle) {
        if let Some(simulated) = self.network.state().open_peer(peer) {
            let flushed = std::mem::take(&mut simulated.buffered);
            simulated.delivered.extend(flushed);
        }
    }
}
