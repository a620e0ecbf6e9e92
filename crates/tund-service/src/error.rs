//! Service errors.

use std::io;
use std::path::PathBuf;
use tund_net::PlatformError;

/// Startup and composition errors. Fatal when they escape `Daemon::start`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Another instance is running with pid {0}")]
    AlreadyRunning(u32),

    #[error("Run marker {path}: {source}")]
    Marker { path: PathBuf, source: io::Error },

    #[error("Failed to bind control endpoint {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
