use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::{
    ClientHostSocket, MemoryNetwork, MemoryPeerHandle, MemoryTransport, ServerSocket,
};
use relay_shared::{
    channels, ClientEvent, LocalConnectionState, PeerIdentity, ServerEvent, ServerSocketConfig,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// Simulated peers send one ping per this many ticks.
const PING_INTERVAL_TICKS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "relay_host")]
#[command(about = "Relay server socket host on the in-memory transport")]
struct Args {
    /// Server socket configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for direct-IP mode
    #[arg(long)]
    address: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    max_clients: Option<u32>,

    /// Listen on the relay network instead of an IP socket
    #[arg(long)]
    p2p: bool,

    /// Also run a client inside this process
    #[arg(long)]
    host_client: bool,

    /// Number of remote peers the in-memory network should simulate
    #[arg(long, default_value_t = 0)]
    simulated_peers: u64,
}

impl Args {
    fn config(&self) -> Result<ServerSocketConfig> {
        let mut config = match &self.config {
            Some(path) => ServerSocketConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerSocketConfig::default(),
        };
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_clients {
            config.maximum_clients = max;
        }
        config.peer_to_peer |= self.p2p;
        Ok(config)
    }
}

struct Host {
    server: ServerSocket<MemoryTransport>,
    server_events: UnboundedReceiver<ServerEvent>,
    client: Option<(ClientHostSocket, UnboundedReceiver<ClientEvent>)>,
    network: MemoryNetwork,
    peers: Vec<MemoryPeerHandle>,
    tick: u64,
}

impl Host {
    fn tick(&mut self) {
        self.tick += 1;
        if self.tick % PING_INTERVAL_TICKS == 0 {
            for &peer in &self.peers {
                self.network
                    .deliver(peer, channels::UNRELIABLE, &self.tick.to_le_bytes());
            }
        }

        self.server.iterate_incoming();
        while let Ok(event) = self.server_events.try_recv() {
            match event {
                ServerEvent::DataReceived {
                    connection_id,
                    channel,
                    payload,
                } => {
                    debug!("{} bytes from {connection_id} on channel {channel}", payload.len());
                    self.server.send_to_client(channel, &payload, connection_id);
                }
                ServerEvent::RemoteConnectionState {
                    connection_id,
                    state,
                } => info!("client {connection_id} is now {state:?}"),
                ServerEvent::LocalConnectionState(state) => info!("server socket is now {state:?}"),
            }
        }

        if let Some((client, events)) = &mut self.client {
            client.iterate_incoming();
            while let Ok(event) = events.try_recv() {
                match event {
                    ClientEvent::DataReceived { channel, payload } => {
                        debug!("client host got {} bytes on channel {channel}", payload.len());
                    }
                    ClientEvent::ConnectionState(state) => info!("client host is now {state:?}"),
                }
            }
        }

        self.server.iterate_outgoing();
        for &peer in &self.peers {
            for message in self.network.take_delivered(peer) {
                debug!("{peer:?} received echo of {} bytes", message.payload.len());
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some((mut client, _)) = self.client.take() {
            if client.local_connection_state() != LocalConnectionState::Stopped {
                client.stop_connection(&mut self.server)?;
            }
        }
        if self.server.local_connection_state() != LocalConnectionState::Stopped {
            self.server.stop()?;
        }
        self.tick();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.config()?;

    let network = MemoryNetwork::new();
    let (server_tx, server_events) = unbounded_channel();
    let mut server = ServerSocket::new(MemoryTransport::new(network.clone()), server_tx);
    server
        .start_with_config(&config)
        .context("starting server socket")?;

    let client = if args.host_client {
        let (client_tx, client_events) = unbounded_channel();
        let mut client = ClientHostSocket::new(client_tx);
        client
            .start_connection(&mut server)
            .context("starting client host")?;
        client.send_to_server(channels::RELIABLE, b"hello from the host");
        Some((client, client_events))
    } else {
        None
    };

    let peers = (0..args.simulated_peers)
        .map(|i| network.connect(PeerIdentity::new(1_000 + i)))
        .collect();

    let mut host = Host {
        server,
        server_events,
        client,
        network,
        peers,
        tick: 0,
    };

    info!("relay host running at {} ticks/s, press Ctrl+C to stop", config.tick_rate);
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / config.tick_rate));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => host.tick(),
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!("ctrl-c handler failed: {err}");
                }
                break;
            }
        }
    }

    info!("shutting down");
    host.shutdown()
}
