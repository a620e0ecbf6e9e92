//! Run marker
//!
//! A PID file written once startup reconciliation is done and removed on
//! graceful shutdown. Finding one at startup means the previous instance
//! either is still running or died without cleaning up.

use crate::error::ServiceError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// What the marker said about the previous instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    /// No marker; the previous instance exited gracefully
    Absent,
    /// Another instance is alive
    Running(u32),
    /// The recorded process is gone or is not ours
    Stale(u32),
    /// The marker could not be read or parsed
    Corrupt(String),
}

impl MarkerState {
    /// Whether the previous instance exited without cleaning up.
    pub fn is_unclean(&self) -> bool {
        matches!(self, MarkerState::Stale(_) | MarkerState::Corrupt(_))
    }
}

/// PID file for the running service.
#[derive(Debug, Clone)]
pub struct RunMarker {
    path: PathBuf,
    /// Process name a live instance runs under
    process_name: String,
}

impl RunMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            process_name: "tund".to_string(),
        }
    }

    /// Match live instances by a different process name.
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inspect the marker left by a previous instance.
    ///
    /// The process table lookup is bounded by `timeout`; a lookup that
    /// does not finish counts as a stale marker.
    pub async fn inspect(&self, timeout: Duration) -> MarkerState {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MarkerState::Absent,
            Err(e) => return MarkerState::Corrupt(e.to_string()),
        };
        let pid = match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => pid,
            _ => return MarkerState::Corrupt(format!("unparsable pid {:?}", content.trim())),
        };
        if pid == std::process::id() {
            return MarkerState::Stale(pid);
        }

        let name = self.process_name.clone();
        let lookup = tokio::task::spawn_blocking(move || process_matches(pid, &name));
        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(true)) => MarkerState::Running(pid),
            Ok(Ok(false)) => MarkerState::Stale(pid),
            Ok(Err(e)) => {
                warn!("Process lookup for pid {} failed: {}", pid, e);
                MarkerState::Stale(pid)
            }
            Err(_) => {
                warn!("Process lookup for pid {} timed out", pid);
                MarkerState::Stale(pid)
            }
        }
    }

    /// Record the current process.
    pub async fn acquire(&self) -> Result<(), ServiceError> {
        let marker_err = |source| ServiceError::Marker {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(marker_err)?;
        }
        tokio::fs::write(&self.path, format!("{}\n", std::process::id()))
            .await
            .map_err(marker_err)?;
        debug!("Run marker written to {}", self.path.display());
        Ok(())
    }

    /// Remove the marker. A missing marker is fine.
    pub async fn release(&self) -> Result<(), ServiceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ServiceError::Marker {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Whether `pid` is alive and runs under `name`.
fn process_matches(pid: u32, name: &str) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(pid)
        .map(|process| process.name().to_string_lossy() == name)
        .unwrap_or(false)
}
