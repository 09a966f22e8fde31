//! Client configuration.

use std::time::Duration;

use scene_net::Metadata;

/// Default transport name, used to pick an endpoint from the join token.
pub const DEFAULT_TRANSPORT: &str = "memory";

/// Protocol version advertised to the host.
pub const PROTOCOL_VERSION: &str = "2";

/// Platform tag advertised to the host.
pub const PLATFORM: &str = concat!("rust/", env!("CARGO_PKG_VERSION"));

/// Default base URL of the token endpoint.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "http://localhost:8081";

/// Configuration for a scene client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Account the application belongs to.
    pub account: String,
    /// Application name.
    pub application: String,
    /// Base URL of the HTTP token endpoint.
    pub token_endpoint: String,
    /// Transport name: advertised in metadata and used to pick the endpoint.
    pub transport: String,
    /// Protocol version advertised in metadata.
    pub protocol_version: String,
    /// Platform tag advertised in metadata.
    pub platform: String,
    /// Extra metadata merged into the connection at bootstrap.
    pub metadata: Metadata,
    /// Fail system requests pending longer than this. `None` never expires.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Create a config for an account and application with default
    /// transport, protocol and platform.
    #[must_use]
    pub fn new(account: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            application: application.into(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            transport: DEFAULT_TRANSPORT.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            platform: PLATFORM.to_string(),
            metadata: Metadata::new(),
            request_timeout: None,
        }
    }

    /// Override the token endpoint base URL.
    #[must_use]
    pub fn with_token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.token_endpoint = url.into();
        self
    }

    /// Override the transport name.
    #[must_use]
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = transport.into();
        self
    }

    /// Override the platform tag.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Add one metadata entry advertised at bootstrap.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Expire pending system requests after `timeout`.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
