//! Error taxonomy.

use crate::profile::ProfileId;
use serde::{Deserialize, Serialize};

/// Failure categories surfaced on runtime records and the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed profile; never retried
    Config,
    /// Credentials rejected; never retried automatically
    AuthFailure,
    /// DNS/route/process failure; retried with bounded backoff
    TransientNetwork,
    /// Duplicate add for an active profile
    ResourceConflict,
    /// OS-level failure while touching interfaces or DNS
    Platform,
}

/// Profile validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileConfigError {
    #[error("Invalid profile id {0:?}")]
    InvalidId(String),

    #[error("Profile {0} has no server")]
    MissingServer(ProfileId),

    #[error("Profile {id}: invalid retry policy: {reason}")]
    InvalidRetry { id: ProfileId, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Registry operation errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Profile {0} is already active")]
    AlreadyActive(ProfileId),

    #[error("Profile {0} not found")]
    NotFound(ProfileId),

    #[error("Invalid profile: {0}")]
    Config(#[from] ProfileConfigError),

    #[error("Registry is not accepting profiles yet")]
    NotReady,

    #[error("Registry is shutting down")]
    ShuttingDown,
}

impl RegistryError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RegistryError::AlreadyActive(_) => Some(ErrorKind::ResourceConflict),
            RegistryError::Config(_) => Some(ErrorKind::Config),
            _ => None,
        }
    }
}
