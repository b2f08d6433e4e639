//! Packets exchanged between a server socket and the client hosted in the same process.
//!
//! These never touch the network: the sender copies its payload into a
//! [`LocalPacket`] and pushes it onto the receiver's [`LocalPacketQueue`], which the
//! receiver drains on its own tick. Producer and consumer may live on different
//! threads, so the queue is lock-free.

use bytes::Bytes;
use crossbeam::queue::SegQueue;

use crate::channels::ChannelId;

/// A buffered message for or from the local client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPacket {
    pub channel: ChannelId,
    pub payload: Bytes,
}

impl LocalPacket {
    pub fn new(channel: ChannelId, payload: Bytes) -> Self {
        Self { channel, payload }
    }

    /// Copies `payload` so the caller may reuse its buffer.
    pub fn copy_from_slice(channel: ChannelId, payload: &[u8]) -> Self {
        Self::new(channel, Bytes::copy_from_slice(payload))
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Unbounded multi-producer FIFO of [`LocalPacket`]s.
#[derive(Debug, Default)]
pub struct LocalPacketQueue {
    inner: SegQueue<LocalPacket>,
}

impl LocalPacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: LocalPacket) {
        self.inner.push(packet);
    }

    /// Pops packets until the queue is observed empty.
    pub fn drain(&self) -> impl Iterator<Item = LocalPacket> + '_ {
        std::iter::from_fn(move || self.inner.pop())
    }

    /// Discards every queued packet, returning how many were dropped.
    pub fn clear(&self) -> usize {
        self.drain().count()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
