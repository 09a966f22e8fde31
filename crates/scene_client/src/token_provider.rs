//! Sources of join tokens for public scenes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Issues join tokens for scenes identified by id.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a token for `scene_id`. `user_data` is the MessagePack-encoded
    /// payload forwarded to the issuer.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the issuer cannot be reached or
    /// refuses the request.
    async fn scene_token(&self, scene_id: &str, user_data: &[u8]) -> Result<String, ClientError>;
}

/// Fetches tokens from the HTTP token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    http: reqwest::Client,
    base_url: String,
    account: String,
    application: String,
}

impl HttpTokenProvider {
    /// Build a provider for the endpoint, account and application in
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.token_endpoint.trim_end_matches('/').to_string(),
            account: config.account.clone(),
            application: config.application.clone(),
        })
    }

    /// The URL tokens for `scene_id` are requested from.
    #[must_use]
    pub fn token_url(&self, scene_id: &str) -> String {
        format!(
            "{}/{}/{}/scenes/{}/token",
            self.base_url, self.account, self.application, scene_id
        )
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn scene_token(&self, scene_id: &str, user_data: &[u8]) -> Result<String, ClientError> {
        let url = self.token_url(scene_id);
        debug!(%url, len = user_data.len(), "requesting scene token");
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
            .body(user_data.to_vec())
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ClientError::Transport(format!(
                "token endpoint returned {status}: {text}"
            )));
        }
        Ok(parse_token_body(&text))
    }
}

/// Tokens may come back bare or as a JSON string literal.
fn parse_token_body(body: &str) -> String {
    let body = body.trim();
    serde_json::from_str::<String>(body).unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_url() {
        let config = ClientConfig::new("acme", "arena").with_token_endpoint("https://api.test/");
        let provider = HttpTokenProvider::new(&config).unwrap();
        assert_eq!(
            provider.token_url("lobby"),
            "https://api.test/acme/arena/scenes/lobby/token"
        );
    }

    #[test]
    fn test_parse_token_body() {
        assert_eq!(parse_token_body("\"abc-def\""), "abc-def");
        assert_eq!(parse_token_body("abc-def\n"), "abc-def");
    }
}
