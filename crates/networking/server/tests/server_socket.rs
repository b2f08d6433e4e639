use relay_server::{
    ClientHostError, ClientHostSocket, MemoryNetwork, MemoryPeerHandle, MemoryTransport,
    PeerConnectionState, SendResult, ServerSocket, ServerSocketError, REASON_DISCONNECTED,
    REASON_MAX_CONNECTIONS,
};
use relay_shared::{
    ClientEvent, ConnectionId, LocalConnectionState, PeerIdentity, RemoteConnectionState,
    ServerEvent,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

struct Harness {
    server: ServerSocket<MemoryTransport>,
    network: MemoryNetwork,
    events: UnboundedReceiver<ServerEvent>,
}

impl Harness {
    fn started(maximum_clients: u32) -> Self {
        let network = MemoryNetwork::new();
        let (tx, events) = unbounded_channel();
        let mut server = ServerSocket::new(MemoryTransport::new(network.clone()), tx);
        server.start("", 7770, maximum_clients, true).unwrap();
        let mut harness = Self {
            server,
            network,
            events,
        };
        harness.drain();
        harness
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    /// Connects `identity` and runs one incoming iteration.
    fn join(&mut self, identity: u64) -> MemoryPeerHandle {
        let handle = self.network.connect(PeerIdentity::new(identity));
        self.server.iterate_incoming();
        handle
    }

    fn id_of(&self, identity: u64) -> Option<ConnectionId> {
        self.server.connection_id_of(&PeerIdentity::new(identity))
    }
}

fn remote(id: u16, state: RemoteConnectionState) -> ServerEvent {
    ServerEvent::RemoteConnectionState {
        connection_id: ConnectionId::new(id),
        state,
    }
}

fn local(state: RemoteConnectionState) -> ServerEvent {
    ServerEvent::RemoteConnectionState {
        connection_id: ConnectionId::LOCAL_CLIENT,
        state,
    }
}

fn data(id: ConnectionId, channel: u8, payload: &[u8]) -> ServerEvent {
    ServerEvent::DataReceived {
        connection_id: id,
        channel,
        payload: bytes::Bytes::copy_from_slice(payload),
    }
}

#[test]
fn connected_peers_get_sequential_ids() {
    let mut h = Harness::started(8);
    let a = h.join(100);
    let b = h.join(200);

    assert_eq!(
        h.drain(),
        vec![
            remote(0, RemoteConnectionState::Started),
            remote(1, RemoteConnectionState::Started),
        ]
    );
    assert_eq!(h.id_of(100), Some(ConnectionId::new(0)));
    assert_eq!(h.id_of(200), Some(ConnectionId::new(1)));
    assert!(h.network.is_accepted(a));
    assert!(h.network.is_accepted(b));
    assert_eq!(h.server.connection_count(), 2);
    assert_eq!(
        h.server.connection_state(ConnectionId::new(1)),
        RemoteConnectionState::Started
    );
    assert_eq!(h.server.connection_address(ConnectionId::new(0)), "100");
}

#[test]
fn released_ids_are_reused_first() {
    let mut h = Harness::started(8);
    let a = h.join(1);
    h.join(2);
    h.network.disconnect(a);
    h.server.iterate_incoming();
    h.join(3);

    assert_eq!(h.id_of(1), None);
    assert_eq!(h.id_of(2), Some(ConnectionId::new(1)));
    assert_eq!(h.id_of(3), Some(ConnectionId::new(0)));
    assert_eq!(
        h.drain(),
        vec![
            remote(0, RemoteConnectionState::Started),
            remote(1, RemoteConnectionState::Started),
            remote(0, RemoteConnectionState::Stopped),
            remote(0, RemoteConnectionState::Started),
        ]
    );
}

#[test]
fn capacity_counts_connections_still_handshaking() {
    let mut h = Harness::started(2);
    let peers: Vec<_> = (0..3)
        .map(|i| h.network.connect(PeerIdentity::new(i)))
        .collect();
    h.server.iterate_incoming();

    assert_eq!(h.server.connection_count(), 2);
    let rejected: Vec<_> = peers
        .iter()
        .filter(|&&peer| h.network.close_reason(peer).as_deref() == Some(REASON_MAX_CONNECTIONS))
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(
        h.drain()
            .iter()
            .filter(|event| matches!(event, ServerEvent::RemoteConnectionState { .. }))
            .count(),
        2
    );
}

#[test]
fn lowering_capacity_keeps_existing_clients() {
    let mut h = Harness::started(4);
    h.join(1);
    h.join(2);
    h.server.set_maximum_clients(1);
    let late = h.join(3);

    assert_eq!(h.server.connection_count(), 2);
    assert_eq!(
        h.network.close_reason(late).as_deref(),
        Some(REASON_MAX_CONNECTIONS)
    );
}

#[test]
fn remote_data_is_tagged_with_connection_id() {
    let mut h = Harness::started(4);
    let peer = h.join(42);
    h.drain();

    h.network.deliver(peer, 1, b"move");
    h.network.deliver(peer, 0, b"chat");
    h.server.iterate_incoming();

    let id = ConnectionId::new(0);
    assert_eq!(h.drain(), vec![data(id, 1, b"move"), data(id, 0, b"chat")]);
}

#[test]
fn receive_batch_limits_messages_per_tick() {
    let mut h = Harness::started(4);
    let peer = h.join(42);
    h.drain();
    h.server.set_receive_batch_size(2);

    for i in 0..5u8 {
        h.network.deliver(peer, 0, &[i]);
    }
    h.server.iterate_incoming();
    assert_eq!(h.drain().len(), 2);
    h.server.iterate_incoming();
    h.server.iterate_incoming();
    assert_eq!(h.drain().len(), 3);
}

#[test]
fn sends_are_flushed_by_outgoing_iteration() {
    let mut h = Harness::started(4);
    let peer = h.join(42);

    h.server.send_to_client(1, b"state", ConnectionId::new(0));
    assert_eq!(h.network.buffered_len(peer), 1);
    assert!(h.network.take_delivered(peer).is_empty());

    h.server.iterate_outgoing();
    let delivered = h.network.take_delivered(peer);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].channel, 1);
    assert_eq!(delivered[0].payload.as_ref(), b"state");
}

#[test]
fn send_to_unknown_connection_is_ignored() {
    let mut h = Harness::started(4);
    h.server.send_to_client(0, b"x", ConnectionId::new(9));
    assert_eq!(h.network.send_calls(), 0);
    assert!(h.drain().is_empty());
}

#[test]
fn lost_connection_on_send_is_torn_down_once() {
    let mut h = Harness::started(4);
    let peer = h.join(7);
    h.drain();

    h.network.force_send_result(peer, Some(SendResult::NoConnection));
    h.server.send_to_client(0, b"x", ConnectionId::new(0));
    h.server.send_to_client(0, b"y", ConnectionId::new(0));
    h.network.disconnect(peer);
    h.server.iterate_incoming();

    assert_eq!(h.drain(), vec![remote(0, RemoteConnectionState::Stopped)]);
    assert_eq!(h.network.send_calls(), 1);
    assert_eq!(
        h.network.close_reason(peer).as_deref(),
        Some(REASON_DISCONNECTED)
    );

    h.join(8);
    assert_eq!(h.id_of(8), Some(ConnectionId::new(0)));
}

#[test]
fn transient_send_failure_keeps_connection() {
    let mut h = Harness::started(4);
    let peer = h.join(7);
    h.drain();

    h.network.force_send_result(peer, Some(SendResult::Other(25)));
    h.server.send_to_client(0, b"x", ConnectionId::new(0));

    assert!(h.drain().is_empty());
    assert_eq!(
        h.server.connection_state(ConnectionId::new(0)),
        RemoteConnectionState::Started
    );
}

#[test]
fn stopping_a_connection_twice_reports_once() {
    let mut h = Harness::started(4);
    let peer = h.join(7);
    h.drain();

    h.server.stop_connection(ConnectionId::new(0)).unwrap();
    assert!(matches!(
        h.server.stop_connection(ConnectionId::new(0)),
        Err(ServerSocketError::UnknownConnection(_))
    ));
    h.network.disconnect(peer);
    h.server.iterate_incoming();

    assert_eq!(h.drain(), vec![remote(0, RemoteConnectionState::Stopped)]);
    assert_eq!(h.server.connection_address(ConnectionId::new(0)), "");
    assert_eq!(
        h.server.connection_state(ConnectionId::new(0)),
        RemoteConnectionState::Stopped
    );
}

#[test]
fn problem_detected_locally_disconnects() {
    let mut h = Harness::started(4);
    let peer = h.join(7);
    h.drain();

    h.network.report_problem(peer);
    h.server.iterate_incoming();
    assert_eq!(h.drain(), vec![remote(0, RemoteConnectionState::Stopped)]);
}

#[test]
fn failed_handshakes_do_not_hold_capacity() {
    let mut h = Harness::started(1);
    let first = h.network.connect(PeerIdentity::new(1));
    h.network.refuse_accept(first);
    h.server.iterate_incoming();

    let second = h.network.connect(PeerIdentity::new(2));
    h.network.disconnect(second);
    h.server.iterate_incoming();

    h.join(3);
    assert_eq!(h.id_of(3), Some(ConnectionId::new(0)));
    assert_eq!(h.drain(), vec![remote(0, RemoteConnectionState::Started)]);
}

#[test]
fn repeated_connected_notification_is_ignored() {
    let mut h = Harness::started(4);
    let peer = h.join(5);
    h.network.notify_state(peer, PeerConnectionState::Connected);
    h.server.iterate_incoming();

    assert_eq!(h.drain(), vec![remote(0, RemoteConnectionState::Started)]);
    assert_eq!(h.server.connection_count(), 1);
}

#[test]
fn reconnecting_identity_is_rejected_without_reordering_free_ids() {
    let mut h = Harness::started(8);
    let first = h.join(1);
    h.join(2);
    let third = h.join(3);
    h.network.disconnect(first);
    h.server.iterate_incoming();
    h.network.disconnect(third);
    h.server.iterate_incoming();
    h.drain();

    let duplicate = h.join(2);
    assert_eq!(
        h.network.close_reason(duplicate).as_deref(),
        Some(REASON_DISCONNECTED)
    );
    assert_eq!(h.id_of(2), Some(ConnectionId::new(1)));
    assert!(h.drain().is_empty());

    h.join(4);
    h.join(5);
    assert_eq!(h.id_of(4), Some(ConnectionId::new(0)));
    assert_eq!(h.id_of(5), Some(ConnectionId::new(2)));
}

#[test]
fn unannounced_connected_at_capacity_gets_no_id() {
    let network = MemoryNetwork::new();
    let (tx, mut events) = unbounded_channel();
    let mut server = ServerSocket::new(MemoryTransport::new(network.clone()), tx);
    // no listen socket yet, so the server never sees this peer's Connecting
    let stray = network.connect(PeerIdentity::new(77));
    server.start("", 7770, 1, true).unwrap();
    network.connect(PeerIdentity::new(1));
    server.iterate_incoming();
    std::iter::from_fn(|| events.try_recv().ok()).for_each(drop);

    network.notify_state(stray, PeerConnectionState::Connected);
    server.iterate_incoming();

    assert_eq!(
        network.close_reason(stray).as_deref(),
        Some(REASON_MAX_CONNECTIONS)
    );
    assert_eq!(server.connection_id_of(&PeerIdentity::new(77)), None);
    assert_eq!(server.connection_count(), 1);
    assert!(events.try_recv().is_err());
}

#[test]
fn nothing_happens_while_stopped() {
    let network = MemoryNetwork::new();
    let (tx, mut events) = unbounded_channel();
    let mut server = ServerSocket::new(MemoryTransport::new(network.clone()), tx);

    server.iterate_incoming();
    server.iterate_outgoing();
    server.send_to_client(0, b"x", ConnectionId::new(0));
    assert!(events.try_recv().is_err());
    assert_eq!(network.send_calls(), 0);
}

#[test]
fn server_can_restart_after_stop() {
    let mut h = Harness::started(4);
    h.join(1);
    h.join(2);
    h.server.stop().unwrap();
    h.server.start("", 7770, 4, true).unwrap();
    h.drain();

    h.join(3);
    assert_eq!(h.id_of(3), Some(ConnectionId::new(0)));
}

#[test]
fn dropping_server_stops_listening() {
    let h = Harness::started(4);
    let network = h.network.clone();
    assert!(network.is_listening());
    drop(h);
    assert!(!network.is_listening());
    assert!(!network.has_subscriber());
}

mod client_host {
    use super::*;

    fn host() -> (ClientHostSocket, UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = unbounded_channel();
        (ClientHostSocket::new(tx), rx)
    }

    fn client_events(rx: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn requires_started_server() {
        let network = MemoryNetwork::new();
        let (tx, _events) = unbounded_channel();
        let mut server = ServerSocket::new(MemoryTransport::new(network), tx);
        let (mut client, mut rx) = host();

        assert_eq!(
            client.start_connection(&mut server),
            Err(ClientHostError::ServerNotStarted)
        );
        assert!(!server.has_client_host());
        assert_eq!(client.local_connection_state(), LocalConnectionState::Stopped);
        assert!(client_events(&mut rx).is_empty());
    }

    #[test]
    fn start_announces_local_client() {
        let mut h = Harness::started(4);
        let (mut client, mut rx) = host();

        client.start_connection(&mut h.server).unwrap();
        assert_eq!(client.connection_id(), ConnectionId::LOCAL_CLIENT);
        assert!(h.server.is_local_client_started());
        assert_eq!(h.drain(), vec![local(RemoteConnectionState::Started)]);
        assert_eq!(
            client_events(&mut rx),
            vec![
                ClientEvent::ConnectionState(LocalConnectionState::Starting),
                ClientEvent::ConnectionState(LocalConnectionState::Started),
            ]
        );
        assert_eq!(
            client.start_connection(&mut h.server),
            Err(ClientHostError::AlreadyActive(LocalConnectionState::Started))
        );
    }

    #[test]
    fn loopback_bypasses_transport() {
        let mut h = Harness::started(4);
        let (mut client, mut rx) = host();
        client.start_connection(&mut h.server).unwrap();
        h.drain();
        client_events(&mut rx);

        client.send_to_server(3, &[1, 2, 3]);
        h.server.iterate_incoming();
        assert_eq!(
            h.drain(),
            vec![data(ConnectionId::LOCAL_CLIENT, 3, &[1, 2, 3])]
        );

        h.server.send_to_client(3, &[4, 5], ConnectionId::LOCAL_CLIENT);
        h.server.iterate_outgoing();
        client.iterate_incoming();
        assert_eq!(
            client_events(&mut rx),
            vec![ClientEvent::DataReceived {
                channel: 3,
                payload: bytes::Bytes::from_static(&[4, 5]),
            }]
        );
        assert_eq!(h.network.send_calls(), 0);
    }

    #[test]
    fn local_data_is_raised_before_remote_data() {
        let mut h = Harness::started(4);
        let peer = h.join(9);
        let (mut client, _rx) = host();
        client.start_connection(&mut h.server).unwrap();
        h.drain();

        h.network.deliver(peer, 0, b"remote");
        client.send_to_server(0, b"local-1");
        client.send_to_server(0, b"local-2");
        h.server.iterate_incoming();

        assert_eq!(
            h.drain(),
            vec![
                data(ConnectionId::LOCAL_CLIENT, 0, b"local-1"),
                data(ConnectionId::LOCAL_CLIENT, 0, b"local-2"),
                data(ConnectionId::new(0), 0, b"remote"),
            ]
        );
    }

    #[test]
    fn client_stop_discards_queued_packets() {
        let mut h = Harness::started(4);
        let (mut client, mut rx) = host();
        client.start_connection(&mut h.server).unwrap();
        h.drain();
        client_events(&mut rx);

        client.send_to_server(0, b"never seen");
        client.stop_connection(&mut h.server).unwrap();
        h.server.iterate_incoming();

        assert_eq!(h.drain(), vec![local(RemoteConnectionState::Stopped)]);
        assert!(!h.server.has_client_host());
        assert_eq!(
            client_events(&mut rx),
            vec![
                ClientEvent::ConnectionState(LocalConnectionState::Stopping),
                ClientEvent::ConnectionState(LocalConnectionState::Stopped),
            ]
        );
        assert_eq!(
            client.stop_connection(&mut h.server),
            Err(ClientHostError::NotActive)
        );
    }

    #[test]
    fn server_can_stop_local_client() {
        let mut h = Harness::started(4);
        let (mut client, _rx) = host();
        client.start_connection(&mut h.server).unwrap();
        h.drain();

        h.server.stop_connection(ConnectionId::LOCAL_CLIENT).unwrap();
        assert_eq!(client.local_connection_state(), LocalConnectionState::Stopped);
        assert_eq!(h.drain(), vec![local(RemoteConnectionState::Stopped)]);
        assert!(matches!(
            h.server.stop_connection(ConnectionId::LOCAL_CLIENT),
            Err(ServerSocketError::NoClientHost)
        ));

        client.send_to_server(0, b"after stop");
        h.server.iterate_incoming();
        assert!(h.drain().is_empty());
    }

    #[test]
    fn sends_are_dropped_after_server_stops() {
        let mut h = Harness::started(4);
        let (mut client, _rx) = host();
        client.start_connection(&mut h.server).unwrap();
        h.server.stop().unwrap();
        h.drain();

        client.send_to_server(0, b"late");
        h.server.start("", 7770, 4, true).unwrap();
        h.server.iterate_incoming();
        assert!(!h
            .drain()
            .iter()
            .any(|event| matches!(event, ServerEvent::DataReceived { .. })));
    }
}
