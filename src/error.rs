// Error handling module
// Defines transport classification and client-facing error types

use thiserror::Error;

/// Failure classes reported by the transport. The transport never retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// HTTP 401
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Any other non-2xx response
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// No response was received
    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    /// HTTP status carried by this error, if a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Unauthorized { .. } => Some(401),
            TransportError::Http { status, .. } => Some(*status),
            TransportError::Network(_) => None,
        }
    }
}

/// Errors surfaced to callers of the client
#[derive(Error, Debug)]
pub enum ApiError {
    /// Token refresh failed; the session is gone and the user must sign in again
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Request failed at the transport level
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response body did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Input rejected before any request was issued
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upload was rejected by the service
    #[error("Upload failed: {message}")]
    Upload { status: Option<u16>, message: String },

    /// Internal client error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// True when the session cannot be recovered without signing in again
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ApiError::AuthExpired(_))
    }

    /// True for a service-reported 404
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ApiError::Transport(TransportError::Http { status: 404, .. })
        )
    }

    /// HTTP status behind this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Transport(e) => e.status(),
            ApiError::Upload { status, .. } => *status,
            _ => None,
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ApiError>;
