//! User-data serializers and the registry negotiated with the host.
//!
//! The client advertises the names of its registered serializers in the
//! connection metadata. The host picks exactly one in its scene-infos reply
//! and every scene on the connection uses it afterwards.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::NetError;

/// Separator used when advertising serializer names in metadata.
pub const ADVERTISE_SEPARATOR: char = ',';

/// A wire format for scene payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serializer {
    /// MessagePack with named fields.
    MsgPack,
    /// UTF-8 JSON.
    Json,
}

impl Serializer {
    /// The name used during negotiation.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MsgPack => "MsgPack",
            Self::Json => "Json",
        }
    }

    /// Resolve a serializer from its negotiation name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MsgPack" => Some(Self::MsgPack),
            "Json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Serialize a value into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Encode`] or [`NetError::Json`] on failure.
    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, NetError> {
        match self {
            Self::MsgPack => crate::codec::encode(value),
            Self::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserialize a value from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Decode`] or [`NetError::Json`] on failure.
    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, NetError> {
        match self {
            Self::MsgPack => crate::codec::decode(bytes),
            Self::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The set of serializers a client is able to speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializerRegistry {
    serializers: Vec<Serializer>,
}

impl SerializerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            serializers: Vec::new(),
        }
    }

    /// Register a serializer. Registering the same one twice is a no-op.
    #[must_use]
    pub fn with(mut self, serializer: Serializer) -> Self {
        if !self.serializers.contains(&serializer) {
            self.serializers.push(serializer);
        }
        self
    }

    /// Look up a registered serializer by its negotiation name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Serializer> {
        self.serializers.iter().copied().find(|s| s.name() == name)
    }

    /// Returns `true` if no serializer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }

    /// Registered serializers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = Serializer> + '_ {
        self.serializers.iter().copied()
    }

    /// The metadata value advertising every registered serializer.
    #[must_use]
    pub fn advertised(&self) -> String {
        self.serializers
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(&ADVERTISE_SEPARATOR.to_string())
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::empty().with(Serializer::MsgPack)
    }
}

/// Split an advertised serializer list back into names.
#[must_use]
pub fn parse_advertised(value: &str) -> Vec<&str> {
    value
        .split(ADVERTISE_SEPARATOR)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}
