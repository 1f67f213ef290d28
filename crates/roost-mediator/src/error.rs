//! Error types for the mediator core.

use thiserror::Error;

/// Mediator errors.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Recipient has no live channel or the send did not complete.
    /// Recovered internally by enqueueing; callers on the route path
    /// never see this as a hard failure.
    #[error("Channel unavailable for {0}")]
    ChannelUnavailable(String),

    /// A message exhausted its retry budget and is terminally failed.
    #[error("Max retries exceeded for message {0}")]
    MaxRetriesExceeded(String),

    /// Broadcast called with an empty recipient set.
    #[error("Broadcast requires at least one recipient")]
    EmptyRecipients,

    /// Durable store unreachable or a statement failed. The affected
    /// operation is fatal; an accept that cannot be confirmed durable
    /// must surface this rather than report success.
    #[error("Store unavailable: {0}")]
    Store(String),

    /// Inbound message missing the fields routing needs.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Mediation gating is enabled and the recipient is not granted.
    #[error("Mediation not granted for {0}")]
    MediationDenied(String),

    /// No queued message with the given id.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// Operation not valid for the message's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Envelope serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MediatorError {
    /// Create a new channel-unavailable error.
    pub fn channel_unavailable(did: impl Into<String>) -> Self {
        Self::ChannelUnavailable(did.into())
    }

    /// Create a new store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new malformed-message error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a new not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a new invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<libsql::Error> for MediatorError {
    fn from(err: libsql::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for MediatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MediatorError>;
