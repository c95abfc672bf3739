// =============================================================================
// Error taxonomy for the streaming layer
// =============================================================================
//
// Transport and authentication failures are recovered by the connection
// monitor; topic parse failures are rejected per topic.  Everything at the
// application boundary uses `anyhow`.
// =============================================================================

use thiserror::Error;

/// Failure of a connection-level operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Socket-level failure: handshake, send, or read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The venue rejected the signed credential.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// The credential was accepted only after its signature expired.
    #[error("authentication completed at {completed_ms} after expiry at {expires_ms}")]
    AuthExpired { expires_ms: i64, completed_ms: i64 },

    /// The venue answered an operation with `success: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The session is already closed (or was never opened).
    #[error("connection already closed")]
    Closed,

    /// No acknowledgement arrived in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ConnectionError {
    /// Authentication failures share backoff with transport failures but are
    /// logged separately.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::AuthExpired { .. })
    }
}

/// Malformed topic string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicParseError {
    #[error("empty topic")]
    Empty,

    #[error("unknown topic category `{0}`")]
    UnknownCategory(String),

    #[error("malformed topic `{0}`")]
    Malformed(String),
}
