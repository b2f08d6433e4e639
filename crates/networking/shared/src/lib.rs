//! Shared types for the relay server socket.
//!
//! - ids: connection ids and durable peer identities
//! - channels: channel tags and their delivery kind
//! - events: socket states, server/client events, transport errors
//! - packet: in-process packets exchanged with the client host
//! - config: TOML-backed socket configuration
//!
//! Keep this crate free of transport specifics; those live behind the server's transport trait.

pub mod channels;
pub mod config;
pub mod events;
pub mod ids;
pub mod packet;

/// Maximum number of messages pulled from a single remote peer per tick.
pub const MAX_MESSAGES_PER_POLL: usize = 256;

pub use channels::{ChannelId, ChannelKind};
pub use config::{ConfigError, ServerSocketConfig};
pub use events::{
    ClientEvent, LocalConnectionState, RemoteConnectionState, ServerEvent, TransportError,
};
pub use ids::{ConnectionId, MAX_REMOTE_CLIENTS, PeerIdentity};
pub use packet::{LocalPacket, LocalPacketQueue};
