//! Platform errors.

use std::time::Duration;

/// Errors raised while manipulating host networking.
///
/// These are logged by the cleaner and never abort a cleanup sequence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("Interface query failed: {0}")]
    Query(String),

    #[error("Not supported on {0}")]
    Unsupported(&'static str),
}
