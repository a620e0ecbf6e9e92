//! Startup reconciliation
//!
//! Detects whether the previous instance left tunnel state behind and
//! resets host networking before any profile is allowed to start.

use crate::error::ServiceError;
use crate::marker::{MarkerState, RunMarker};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tund_net::NetworkCleaner;
use tund_profile::ProfileRegistry;

/// What startup reconciliation found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoCleanReport {
    pub previous: MarkerState,
    pub stray_interfaces: Vec<String>,
    /// Host state was judged dirty
    pub dirty: bool,
    /// A global network reset ran
    pub reset: bool,
    /// Stale per-profile runtime files removed
    pub stale_files: usize,
}

/// One-shot startup reconciliation.
pub struct AutoClean {
    cleaner: NetworkCleaner,
    marker: RunMarker,
    profiles_dir: PathBuf,
    disable_net_clean: bool,
    query_timeout: Duration,
}

impl AutoClean {
    pub fn new(cleaner: NetworkCleaner, marker: RunMarker, profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            cleaner,
            marker,
            profiles_dir: profiles_dir.into(),
            disable_net_clean: false,
            query_timeout: Duration::from_secs(5),
        }
    }

    pub fn disable_net_clean(mut self, disable: bool) -> Self {
        self.disable_net_clean = disable;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Reconcile host state, then open `registry` for profiles.
    ///
    /// Fails only when another instance is running or the marker cannot
    /// be written; the registry stays closed in that case.
    pub async fn run(&self, registry: &ProfileRegistry) -> Result<AutoCleanReport, ServiceError> {
        let previous = self.marker.inspect(self.query_timeout).await;
        if let MarkerState::Running(pid) = previous {
            return Err(ServiceError::AlreadyRunning(pid));
        }
        match &previous {
            MarkerState::Absent => debug!("Previous instance exited gracefully"),
            MarkerState::Stale(pid) => warn!("Previous instance (pid {}) exited uncleanly", pid),
            MarkerState::Corrupt(e) => warn!("Run marker unreadable ({}), assuming unclean exit", e),
            MarkerState::Running(_) => {}
        }

        let (stray_interfaces, query_failed) =
            match tokio::time::timeout(self.query_timeout, self.cleaner.stray_interfaces()).await {
                Ok(Ok(list)) => (list, false),
                Ok(Err(e)) => {
                    warn!("Interface query failed, assuming dirty: {}", e);
                    (Vec::new(), true)
                }
                Err(_) => {
                    warn!("Interface query timed out, assuming dirty");
                    (Vec::new(), true)
                }
            };
        // The OS owns some tunnel-named interfaces (utunN on macOS); they
        // only matter after an unclean exit.
        let dirty = previous.is_unclean() || query_failed;
        if !stray_interfaces.is_empty() {
            if dirty {
                info!("Found leftover tunnel interfaces: {}", stray_interfaces.join(", "));
            } else {
                debug!(
                    "Ignoring tunnel interfaces after graceful exit: {}",
                    stray_interfaces.join(", ")
                );
            }
        }
        let mut reset = false;
        if dirty {
            if self.disable_net_clean {
                info!("Network state is dirty, but network cleaning is disabled");
            } else {
                info!("Resetting host networking after unclean exit");
                if let Err(e) = self.cleaner.global_reset().await {
                    warn!("Startup network reset incomplete: {}", e);
                }
                reset = true;
            }
        }

        let stale_files = self.clean_runtime_files().await;
        self.marker.acquire().await?;
        registry.open();

        Ok(AutoCleanReport {
            previous,
            stray_interfaces,
            dirty,
            reset,
            stale_files,
        })
    }

    /// Remove files left under the per-profile runtime directory.
    async fn clean_runtime_files(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.profiles_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("Cannot read {}: {}", self.profiles_dir.display(), e);
                return 0;
            }
        };
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Cannot list {}: {}", self.profiles_dir.display(), e);
                    break;
                }
            };
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("Removed {} stale profile runtime file(s)", removed);
        }
        removed
    }
}
