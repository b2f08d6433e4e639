//! Logische Kanäle, über die Nachrichten transportiert werden.

use serde::{Deserialize, Serialize};

/// Raw channel tag carried alongside every payload.
pub type ChannelId = u8;

/// Reliable, ordered delivery.
pub const RELIABLE: ChannelId = 0;
/// Best-effort delivery.
pub const UNRELIABLE: ChannelId = 1;

/// Delivery guarantee a transport should use for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Reliable,
    Unreliable,
}

impl ChannelKind {
    /// Only [`UNRELIABLE`] is sent best-effort; every other tag is treated as reliable.
    pub const fn of(channel: ChannelId) -> Self {
        if channel == UNRELIABLE {
            ChannelKind::Unreliable
        } else {
            ChannelKind::Reliable
        }
    }
}
