//! # scene_net
//!
//! Wire layer of the scene client.
//!
//! This crate provides:
//!
//! - [`message_ids`]: fixed message kinds and the scene handle base.
//! - [`framing`]: two-byte little-endian id / route-index prefixes.
//! - [`messages`]: system request and reply bodies.
//! - [`codec`]: MessagePack helpers for system bodies.
//! - [`serializer`]: negotiable user-data serializers and their registry.
//! - [`token`]: join-token decoding.
//! - [`connection`]: the transport contract and bootstrap metadata.
//! - [`memory`]: an in-process transport.
//! - [`error`]: wire-layer error types.

pub mod codec;
pub mod connection;
pub mod error;
pub mod framing;
pub mod memory;
pub mod message_ids;
pub mod messages;
pub mod serializer;
pub mod token;

pub use codec::{decode, encode};
pub use connection::{
    Connection, ConnectionMetadata, InboundHandler, MetadataBuilder, PacketPriority,
    PacketReliability,
};
pub use error::NetError;
pub use memory::MemoryConnection;
pub use messages::Metadata;
pub use serializer::{Serializer, SerializerRegistry};
pub use token::{TokenData, decode_token};
