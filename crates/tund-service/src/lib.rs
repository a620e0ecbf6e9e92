//! tund Service
//!
//! The always-on half of the client: startup reconciliation, the local
//! control API, background profile discovery and the ordered shutdown
//! that leaves host networking clean.

mod autoclean;
mod config;
mod control;
mod daemon;
mod error;
mod marker;
mod server;
mod shutdown;
mod watch;

pub use autoclean::{AutoClean, AutoCleanReport};
pub use config::{
    ControlConfig, NetworkConfig, ServiceConfig, ShutdownConfig, Transport, TunnelConfig,
    WatchConfig, DEFAULT_CONFIG_PATH, DEFAULT_CONTROL_PORT,
};
pub use control::{router, ControlState, ErrorResponse, StatusResponse};
pub use daemon::{install, uninstall, Daemon};
pub use error::ServiceError;
pub use marker::{MarkerState, RunMarker};
pub use server::{serve, Endpoint, ServerHandle};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use watch::{SystemProfileWatcher, WatcherHandle};
