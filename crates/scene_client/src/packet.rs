//! Inbound packets as seen by processors and route handlers.

use std::sync::Arc;

use scene_net::{Connection, Serializer};
use serde::de::DeserializeOwned;

use crate::error::ClientError;
use crate::scene::Scene;

/// Annotations added while a packet travels through the dispatch chain.
#[derive(Debug, Clone, Default)]
pub struct PacketMetadata {
    /// The scene that claimed the packet.
    pub scene: Option<Scene>,
    /// Local route index stripped from the payload.
    pub route_index: Option<u16>,
    /// Id of the system request or response carried by the packet.
    pub request_id: Option<u16>,
}

/// A frame received from a peer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// The connection the packet arrived on.
    pub source: Arc<dyn Connection>,
    /// Remaining payload. Prefixes are removed as they are interpreted.
    pub payload: Vec<u8>,
    /// Serializer used by [`Packet::read`].
    pub serializer: Serializer,
    /// Dispatch annotations.
    pub metadata: PacketMetadata,
}

impl Packet {
    /// Create a packet with empty metadata, read with MessagePack.
    #[must_use]
    pub fn new(source: Arc<dyn Connection>, payload: Vec<u8>) -> Self {
        Self {
            source,
            payload,
            serializer: Serializer::MsgPack,
            metadata: PacketMetadata::default(),
        }
    }

    /// Deserialize the payload with the packet's serializer.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if the payload does not decode.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(self.serializer.deserialize(&self.payload)?)
    }

    /// The scene that claimed this packet, if any.
    #[must_use]
    pub fn scene(&self) -> Option<&Scene> {
        self.metadata.scene.as_ref()
    }

    /// The local route index the packet was addressed to, if any.
    #[must_use]
    pub fn route_index(&self) -> Option<u16> {
        self.metadata.route_index
    }

    /// The system request id the packet carried, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u16> {
        self.metadata.request_id
    }
}
