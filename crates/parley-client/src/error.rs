use parley_types::ProtocolError;

use crate::transcript::CacheError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    // ========================================================================
    // Credentials
    // ========================================================================
    #[error("authentication required: {0}")]
    Auth(String),

    // ========================================================================
    // Transport
    // ========================================================================
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    // ========================================================================
    // REST
    // ========================================================================
    #[error("request failed: {0}")]
    Network(String),

    // ========================================================================
    // Local state
    // ========================================================================
    #[error("no active session")]
    NoActiveSession,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ClientError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Whether retrying without user action can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::NotConnected | Self::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_network_failures_are_retriable() {
        assert!(ClientError::Connect("refused".into()).is_retriable());
        assert!(ClientError::NotConnected.is_retriable());
        assert!(ClientError::Network("timeout".into()).is_retriable());
        assert!(!ClientError::Auth("no token".into()).is_retriable());
        assert!(!ClientError::ConnectionLost { attempts: 5 }.is_retriable());
        assert!(ClientError::Auth("401".into()).is_auth());
    }
}
