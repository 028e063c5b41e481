use thiserror::Error;

use crate::ids::{NetId, RequestId};

/// Errors surfaced synchronously by arbiter operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    /// Malformed caller input. No state was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller's outstanding request budget is spent.
    #[error("too many requests for uid {uid} (limit {limit})")]
    TooManyRequests { uid: u32, limit: usize },

    /// The caller lacks a permission the operation requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A trusted collaborator broke an invariant (for example an agent
    /// changing an immutable capability). The update was rejected.
    #[error("internal consistency violation: {0}")]
    Internal(String),

    #[error("unknown network {0}")]
    UnknownNetwork(NetId),

    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
}

impl ArbiterError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }
}
