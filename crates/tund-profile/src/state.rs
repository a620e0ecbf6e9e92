//! Profile states, runtime records and lifecycle events.

use crate::error::ErrorKind;
use crate::profile::{Profile, ProfileId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tund_net::NetworkOverride;

/// Connection state of one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileState {
    /// Initial and terminal state
    Disconnected,
    /// Tunnel process started, waiting for it to report success
    Connecting,
    /// Tunnel is up
    Connected,
    /// Waiting out a backoff before the next attempt
    Reconnecting,
    /// Stopping the process and rolling back host changes
    Disconnecting,
}

impl ProfileState {
    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: ProfileState) -> bool {
        use ProfileState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileState::Disconnected => "disconnected",
            ProfileState::Connecting => "connecting",
            ProfileState::Connected => "connected",
            ProfileState::Reconnecting => "reconnecting",
            ProfileState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ProfileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Snapshot of a profile's runtime state.
///
/// Written only by the profile's own state machine; everyone else
/// reads clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub id: ProfileId,
    pub name: String,
    pub state: ProfileState,
    /// Unix seconds when the tunnel last reached Connected
    pub started_at: Option<u64>,
    pub last_error: Option<ErrorRecord>,
    pub reconnect_attempts: u32,
    pub pid: Option<u32>,
    pub interface: Option<String>,
    pub network_override: Option<NetworkOverride>,
}

impl RuntimeRecord {
    pub fn new(profile: &Profile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.display_name().to_string(),
            state: ProfileState::Disconnected,
            started_at: None,
            last_error: None,
            reconnect_attempts: 0,
            pid: None,
            interface: None,
            network_override: None,
        }
    }
}

/// Lifecycle events broadcast by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileEvent {
    StateChanged {
        id: ProfileId,
        from: ProfileState,
        to: ProfileState,
    },
    Error {
        id: ProfileId,
        error: ErrorRecord,
    },
    Removed {
        id: ProfileId,
    },
}

impl ProfileEvent {
    pub fn id(&self) -> &ProfileId {
        match self {
            ProfileEvent::StateChanged { id, .. }
            | ProfileEvent::Error { id, .. }
            | ProfileEvent::Removed { id } => id,
        }
    }
}

/// Current time as unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
