//! Client-level error taxonomy.

use scene_net::NetError;

/// Errors surfaced by the scene client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// An argument was rejected (reserved route name, missing collaborator).
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    State(String),

    /// The host or a token violated the protocol (unknown route, serializer
    /// mismatch, malformed body or token).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every system request id is in use.
    #[error("no free system request id ({0} requests pending)")]
    ResourceExhausted(usize),

    /// The host answered a system request with an explicit error.
    #[error("remote fault: {0}")]
    RemoteFault(String),

    /// The connection failed; the cause is not interpreted.
    #[error("transport error: {0}")]
    Transport(String),

    /// A system request stayed pending longer than the configured timeout.
    #[error("system request {0} timed out")]
    Timeout(u16),
}

impl From<NetError> for ClientError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Encode(_)
            | NetError::Decode(_)
            | NetError::Json(_)
            | NetError::Token(_)
            | NetError::Frame(_) => Self::Protocol(err.to_string()),
            NetError::NotOpen | NetError::Closed | NetError::Transport(_) => {
                Self::Transport(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_errors_map_to_taxonomy() {
        assert!(matches!(
            ClientError::from(NetError::Token("bad".into())),
            ClientError::Protocol(_)
        ));
        assert!(matches!(
            ClientError::from(NetError::Frame("short".into())),
            ClientError::Protocol(_)
        ));
        assert!(matches!(
            ClientError::from(NetError::Closed),
            ClientError::Transport(_)
        ));
        assert!(matches!(
            ClientError::from(NetError::NotOpen),
            ClientError::Transport(_)
        ));
    }
}
