//! Error types for the coin-link client library.

use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout coin-link.
pub type Result<T> = std::result::Result<T, CoinLinkError>;

/// All errors the coin-link client can produce.
#[derive(Debug, Error)]
pub enum CoinLinkError {
    /// Non-success HTTP status from the plain merchant/identity transport.
    #[error("transport error: HTTP {status_code}: {message}")]
    TransportError { status_code: u16, message: String },

    /// Error reported by the remote service itself, over either transport.
    /// For channel answers the code is the textual payload of the `R` frame;
    /// for the merchant REST endpoint it is the numeric error code.
    #[error("service error [{code}]: {message}")]
    ServiceError { code: String, message: String },

    /// No matching correlated answer arrived within the command deadline.
    #[error("command timed out after {0:?}")]
    ProtocolTimeout(Duration),

    /// Locally detected invalid argument; no network round trip was made.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Operation attempted on a connection in the wrong state
    /// (double-connect, command before connect, disconnect while idle).
    #[error("lifecycle error: {0}")]
    LifecycleError(String),

    /// Underlying WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocketError(String),

    /// Invalid client configuration (bad URL, missing token).
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// HTTP request failure below the status-code level.
    #[error("http request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Malformed JSON in a service payload.
    #[error("failed to decode service payload: {0}")]
    DecodeError(#[from] serde_json::Error),
}

impl CoinLinkError {
    /// Shorthand for a channel-answer service error, where the payload
    /// text doubles as the error code.
    pub(crate) fn service(code: impl Into<String>) -> Self {
        let code = code.into();
        CoinLinkError::ServiceError {
            message: code.clone(),
            code,
        }
    }
}
