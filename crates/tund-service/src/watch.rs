//! System profile watcher
//!
//! Polls a directory of system-wide profile files and starts the ones
//! marked `autostart`. Only produces Adds; it never stops a profile.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tund_profile::{Profile, ProfileRegistry, RegistryError, RegistryPhase};

/// Background poller over a profile directory.
pub struct SystemProfileWatcher {
    dir: PathBuf,
    interval: Duration,
    registry: ProfileRegistry,
    /// Modification time of every file already handled
    seen: HashMap<PathBuf, SystemTime>,
}

/// Stops the watcher task.
pub struct WatcherHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Profile watcher task failed: {}", e);
        }
    }
}

impl SystemProfileWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration, registry: ProfileRegistry) -> Self {
        Self {
            dir: dir.into(),
            interval,
            registry,
            seen: HashMap::new(),
        }
    }

    /// Run until stopped, scanning once immediately.
    pub fn spawn(mut self) -> WatcherHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!("Watching {} for system profiles", self.dir.display());
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.scan().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Profile watcher stopped");
        });
        WatcherHandle { stop_tx, task }
    }

    /// One pass over the directory. Returns the number of profiles started.
    pub async fn scan(&mut self) -> usize {
        let files = match list_profile_files(&self.dir).await {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("Cannot read {}: {}", self.dir.display(), e);
                return 0;
            }
        };
        self.seen.retain(|path, _| files.iter().any(|(p, _)| p == path));

        let mut started = 0;
        for (path, modified) in files {
            if self.seen.get(&path) == Some(&modified) {
                continue;
            }
            if self.handle_file(&path).await {
                started += 1;
            }
            if self.registry.phase() == RegistryPhase::Starting {
                // Retried once the registry opens
                continue;
            }
            self.seen.insert(path, modified);
        }
        started
    }

    async fn handle_file(&self, path: &Path) -> bool {
        let profile = match tokio::fs::read_to_string(path).await {
            Ok(content) => match Profile::from_toml(&content) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    return false;
                }
            },
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                return false;
            }
        };
        if !profile.autostart {
            debug!(profile = %profile.id, "Not marked autostart");
            return false;
        }

        let id = profile.id.clone();
        match self.registry.add(profile) {
            Ok(()) => {
                info!(profile = %id, "Started system profile from {}", path.display());
                true
            }
            Err(RegistryError::AlreadyActive(_)) => {
                debug!(profile = %id, "System profile already active");
                false
            }
            Err(RegistryError::NotReady) => {
                debug!(profile = %id, "Registry not open yet");
                false
            }
            Err(e) => {
                warn!(profile = %id, "Cannot start system profile: {}", e);
                false
            }
        }
    }
}

/// `*.toml` files in `dir` with their modification times, sorted by path.
async fn list_profile_files(dir: &Path) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        files.push((path, metadata.modified()?));
    }
    files.sort();
    Ok(files)
}
