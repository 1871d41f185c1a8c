//! Common error types for Peal.

use thiserror::Error;

use crate::protocol::{CallRole, CallStatus};

/// Result type alias using Peal's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for signaling and negotiation operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No verified actor behind the request.
    #[error("not authenticated")]
    Unauthenticated,

    /// Actor is not a participant of the call, or holds the wrong role.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Unknown call id.
    #[error("call not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the record's current status.
    #[error("call is {status}, operation not permitted")]
    InvalidState { status: CallStatus },

    /// A user cannot place a call to themselves.
    #[error("cannot call yourself")]
    SelfCall,

    /// Busy guard rejection: the named party already has an active call.
    #[error("{role} already has an active call")]
    Busy { role: CallRole },

    /// Local media denied or unavailable.
    #[error("media access: {0}")]
    MediaAccess(String),

    /// Local transport reported failed/disconnected/closed.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Record store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a not-authorized error from any displayable type.
    pub fn not_authorized(msg: impl std::fmt::Display) -> Self {
        Self::NotAuthorized(msg.to_string())
    }

    /// Create a not-found error for a call id.
    pub fn not_found(call_id: impl std::fmt::Display) -> Self {
        Self::NotFound(call_id.to_string())
    }

    /// Create a media access error from any displayable type.
    pub fn media_access(msg: impl std::fmt::Display) -> Self {
        Self::MediaAccess(msg.to_string())
    }

    /// Create a connectivity error from any displayable type.
    pub fn connectivity(msg: impl std::fmt::Display) -> Self {
        Self::Connectivity(msg.to_string())
    }

    /// Create a storage error from any displayable type.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }
}
