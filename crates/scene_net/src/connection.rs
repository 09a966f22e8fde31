//! The transport contract consumed by the scene client.
//!
//! The client never talks to sockets directly. It needs a connection that
//! can be opened once, send tagged byte frames, and hand every inbound frame
//! to a single hook. Delivery guarantees belong to the implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetError;
use crate::messages::Metadata;

/// Called with `(tag, payload)` for every inbound frame.
pub type InboundHandler = Arc<dyn Fn(u8, Vec<u8>) + Send + Sync>;

/// Channel used when the caller does not pick one.
pub const DEFAULT_CHANNEL: u8 = 0;

/// Well-known connection metadata keys.
pub mod keys {
    /// Comma-separated serializer names the client understands.
    pub const SERIALIZERS: &str = "serializers";
    /// Transport name.
    pub const TRANSPORT: &str = "transport";
    /// Protocol version.
    pub const PROTOCOL: &str = "protocol";
    /// Platform tag of the client library.
    pub const PLATFORM: &str = "platform";
}

/// Send priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketPriority {
    /// Bypass any queueing.
    Immediate,
    /// Ahead of medium and low traffic.
    High,
    /// Regular traffic.
    #[default]
    Medium,
    /// Background traffic.
    Low,
}

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketReliability {
    /// Fire and forget.
    Unreliable,
    /// Fire and forget, stale packets dropped.
    UnreliableSequenced,
    /// Delivered, in any order.
    Reliable,
    /// Delivered in order.
    #[default]
    ReliableOrdered,
    /// Delivered, stale packets dropped.
    ReliableSequenced,
}

/// Immutable snapshot of the metadata a connection was opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata(Arc<Metadata>);

impl ConnectionMetadata {
    /// Look up a single entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Borrow the whole map.
    #[must_use]
    pub fn as_map(&self) -> &Metadata {
        &self.0
    }

    /// Clone the entries into an owned map, for wire bodies.
    #[must_use]
    pub fn to_map(&self) -> Metadata {
        (*self.0).clone()
    }

    /// Returns `true` if the snapshot has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Accumulates bootstrap metadata, then freezes it into a
/// [`ConnectionMetadata`] snapshot.
///
/// Later writes to the same key win.
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    entries: Metadata,
}

impl MetadataBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one entry.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Merge many entries.
    #[must_use]
    pub fn extend<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.entries
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Freeze the entries.
    #[must_use]
    pub fn build(self) -> ConnectionMetadata {
        ConnectionMetadata(Arc::new(self.entries))
    }
}

/// A bidirectional, message-oriented link to the host.
///
/// Implementations must be safe to share between threads: sends may happen
/// from any task while inbound frames are delivered on the transport's own
/// receive path.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Open the link to `endpoint`, advertising `metadata`.
    ///
    /// # Errors
    ///
    /// Returns a [`NetError`] if the transport cannot be started.
    async fn open(&self, endpoint: &str, metadata: ConnectionMetadata) -> Result<(), NetError>;

    /// The metadata snapshot the link was opened with.
    fn metadata(&self) -> ConnectionMetadata;

    /// Returns `true` between a successful `open` and `close`.
    fn is_open(&self) -> bool;

    /// Send a system frame tagged with `msg_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`NetError`] if the link is not open or the send fails.
    fn send_system(&self, msg_id: u8, payload: Vec<u8>) -> Result<(), NetError>;

    /// Send scene traffic tagged with `scene_handle`, prefixed by
    /// `route_index`.
    ///
    /// # Errors
    ///
    /// Returns a [`NetError`] if the link is not open or the send fails.
    fn send_to_scene(
        &self,
        scene_handle: u8,
        route_index: u16,
        payload: &[u8],
        priority: PacketPriority,
        reliability: PacketReliability,
        channel: u8,
    ) -> Result<(), NetError>;

    /// Install the hook receiving every inbound frame. Replaces any
    /// previous hook.
    fn set_inbound_handler(&self, handler: InboundHandler);

    /// Close the link. Sends fail afterwards.
    fn close(&self);
}
