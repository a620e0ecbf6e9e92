//! tund Profile Lifecycle
//!
//! Owns every active tunnel: one state machine task per profile,
//! one supervised tunnel process per state machine, and the registry
//! that maps profile ids to running machines.
//!
//! # Architecture
//!
//! ```text
//! ProfileRegistry ──add/remove──▶ ProfileStateMachine ──spawn/stop──▶ ProcessSupervisor
//!        ▲                              │        ▲                          │
//!        │ snapshots (watch)            │        └──── ProcessEvent ─────────┘
//!        └──────────────────────────────┘                     (status lines)
//!                                       │
//!                                       └──rollback──▶ NetworkCleaner
//! ```

mod error;
mod launcher;
mod machine;
mod profile;
mod registry;
mod retry;
mod state;
mod status;
mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{ErrorKind, ProfileConfigError, RegistryError};
pub use launcher::{LauncherConfig, ProcessLauncher};
pub use machine::{MachineCommand, MachineContext, MachineHandle, ProfileStateMachine};
pub use profile::{Profile, ProfileId, RoutingPolicy};
pub use registry::{ProfileRegistry, RegistryConfig, RegistryPhase};
pub use retry::RetryPolicy;
pub use state::{ErrorRecord, ProfileEvent, ProfileState, RuntimeRecord};
pub use status::{StatusMarker, StatusTracker};
pub use supervisor::{
    ExitClass, ExitReport, LaunchedProcess, Launcher, ProcessEvent, ProcessSupervisor,
    SpawnError, SupervisorHandle, TunnelProcess,
};
