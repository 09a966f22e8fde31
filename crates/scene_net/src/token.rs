//! Join-token decoding.
//!
//! A token is `<base64(json)>-<signature>`. Only the leading segment is
//! interpreted on the client; the signature is checked by the host.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::messages::Metadata;

/// Separator between the data segment and the signature.
pub const TOKEN_SEPARATOR: char = '-';

/// The decoded data segment of a join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenData {
    /// The scene the token grants access to.
    pub scene_id: String,
    /// Host address per transport name.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    /// Metadata to merge into the connection at bootstrap.
    #[serde(default)]
    pub connection_metadata: Metadata,
    /// Issuing account.
    #[serde(default)]
    pub account_id: Option<String>,
    /// Issuing application.
    #[serde(default)]
    pub application: Option<String>,
    /// Expiration as issued by the host; not enforced client-side.
    #[serde(default)]
    pub expiration: Option<String>,
}

impl TokenData {
    /// Create token data for a scene with no endpoints.
    #[must_use]
    pub fn new(scene_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            endpoints: HashMap::new(),
            connection_metadata: Metadata::new(),
            account_id: None,
            application: None,
            expiration: None,
        }
    }

    /// Add an endpoint for a transport.
    #[must_use]
    pub fn with_endpoint(mut self, transport: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(transport.into(), address.into());
        self
    }

    /// The endpoint for `transport`, if the token carries one.
    #[must_use]
    pub fn endpoint(&self, transport: &str) -> Option<&str> {
        self.endpoints.get(transport).map(String::as_str)
    }
}

/// Decode the data segment of a join token.
///
/// # Errors
///
/// Returns [`NetError::Token`] if the token is empty, not valid base64, or
/// does not hold the expected JSON document.
pub fn decode_token(token: &str) -> Result<TokenData, NetError> {
    let data = token
        .split_once(TOKEN_SEPARATOR)
        .map_or(token, |(data, _signature)| data)
        .trim();
    if data.is_empty() {
        return Err(NetError::Token("empty data segment".to_string()));
    }
    let json = STANDARD
        .decode(data)
        .map_err(|e| NetError::Token(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| NetError::Token(format!("invalid payload: {e}")))
}

/// Build a token from data and a signature.
///
/// # Errors
///
/// Returns [`NetError::Json`] if the data cannot be serialised.
pub fn encode_token(data: &TokenData, signature: &str) -> Result<String, NetError> {
    let json = serde_json::to_vec(data)?;
    Ok(format!("{}{TOKEN_SEPARATOR}{signature}", STANDARD.encode(json)))
}
