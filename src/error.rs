use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("data integrity error: {0}")]
    Integrity(String),

    #[error("unexpected response shape: {0}")]
    Schema(String),

    #[error("remote rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("not found")]
    NotFound,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("in-flight download was abandoned before completing")]
    InFlightAborted,
}

impl Error {
    /// Network and timeout failures are retried on the next scheduled tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::InFlightAborted => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Local state can no longer be trusted and must be rebuilt from the backend.
    #[must_use]
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Schema(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
