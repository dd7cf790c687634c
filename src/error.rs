use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Domain-stable error kinds for the core.
///
/// Malformed inbound frames never surface here; they are logged and dropped
/// at the layer that sees them. Everything below is visible to callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid pairing uri: {0}")]
    InvalidUri(String),

    #[error("no matching key for {0}")]
    NoMatchingKey(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("envelope authentication failed")]
    AuthenticationFailed,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("relay transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("user disconnected")]
    UserDisconnected,

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("relay rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True for transport-level failures where a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportUnavailable(_) | Error::Timeout(_))
    }
}
