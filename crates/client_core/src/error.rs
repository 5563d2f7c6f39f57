use std::fmt;

use thiserror::Error;

/// Remote capabilities guarded by a session circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    PresenceWrite,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::PresenceWrite => f.write_str("presence heartbeat"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("rejected: {0}")]
    Validation(String),
    #[error("{0} is disabled for this session after an earlier failure")]
    CapabilityUnavailable(Capability),
    #[error("remote store request failed: {0}")]
    Remote(#[from] anyhow::Error),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
