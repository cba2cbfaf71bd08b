//! Error types for client operations.
//!
//! Callers can tell transient transport failures (recovered internally by the
//! reconnect loop) apart from terminal auth/parse failures and from the
//! per-call rejections (`BufferFull`, `Closed`) they must handle themselves.

use thiserror::Error;

use crate::buffer::BufferLimit;

/// Top-level error type for the courier client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transport-level failure. Triggers the reconnect path while connected;
    /// surfaces only when the retry policy is exhausted.
    #[error("network error: {0}")]
    Network(String),

    /// Credential or server-side authorization rejection. Never retried.
    #[error("authorization error: {0}")]
    Auth(String),

    /// The reconnect buffer cannot take the publish.
    #[error("reconnect buffer full: {limit} limit reached")]
    BufferFull { limit: BufferLimit },

    /// The connection was closed, explicitly or after a terminal failure.
    #[error("connection closed")]
    Closed,

    /// Malformed credentials bundle.
    #[error("credentials parse error: {0}")]
    Parse(String),

    /// Invalid or incomplete options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Subject or subscription pattern is not well formed.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    /// Operation did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Peer sent something we did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns true if this error is transient and the reconnect loop may
    /// recover from it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Returns true if this error ends the connection for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Parse(_) | Error::Closed)
    }

    /// Returns true if the publish was rejected by the reconnect buffer.
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, Error::BufferFull { .. })
    }
}

/// Shorthand result alias for client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let network = Error::Network("conn reset".into());
        assert!(network.is_retryable());
        assert!(!network.is_terminal());

        let timeout = Error::Timeout("no pong".into());
        assert!(timeout.is_retryable());

        let auth = Error::Auth("authorization violation".into());
        assert!(!auth.is_retryable());
        assert!(auth.is_terminal());

        let parse = Error::Parse("missing jwt".into());
        assert!(!parse.is_retryable());
        assert!(parse.is_terminal());

        let full = Error::BufferFull {
            limit: BufferLimit::Entries(2),
        };
        assert!(full.is_buffer_full());
        assert!(!full.is_retryable());
        assert!(!full.is_terminal());

        assert!(Error::Closed.is_terminal());
        assert!(!Error::Config("no servers".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::BufferFull {
            limit: BufferLimit::Bytes(64),
        };
        let msg = format!("{err}");
        assert!(msg.contains("64 bytes"));

        let err = Error::InvalidSubject("foo..bar".into());
        assert_eq!(format!("{err}"), "invalid subject 'foo..bar'");
    }
}
