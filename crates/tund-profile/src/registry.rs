//! Profile registry
//!
//! Maps profile ids to running state machines. The map is the only
//! structure written by more than one task; its lock is held for map
//! reads and writes only, never across a spawn, a stop or a wait.

use crate::error::RegistryError;
use crate::machine::{MachineContext, MachineHandle, ProfileStateMachine};
use crate::profile::{Profile, ProfileId};
use crate::retry::RetryPolicy;
use crate::state::{ProfileEvent, RuntimeRecord};
use crate::supervisor::Launcher;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tund_net::NetworkCleaner;

/// Whether the registry accepts new profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryPhase {
    /// Startup reconciliation has not finished
    Starting,
    Accepting,
    ShuttingDown,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Policy for profiles without their own
    pub retry: RetryPolicy,
    /// Grace before a stopping tunnel is killed
    pub stop_grace: Duration,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stop_grace: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

struct Entry {
    profile: Profile,
    generation: u64,
    handle: MachineHandle,
    done: watch::Receiver<bool>,
}

struct Table {
    phase: RegistryPhase,
    entries: HashMap<ProfileId, Entry>,
    next_generation: u64,
}

struct Inner {
    table: Mutex<Table>,
    ctx: MachineContext,
    config: RegistryConfig,
    /// Number of entries, for waiting on drain
    active: watch::Sender<usize>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the entry once its machine is done, unless it was replaced.
    fn finish(&self, id: &ProfileId, generation: u64) {
        let removed = {
            let mut table = self.lock();
            let current = table.entries.get(id).map(|e| e.generation);
            if current == Some(generation) {
                table.entries.remove(id);
                self.active.send_replace(table.entries.len());
                true
            } else {
                false
            }
        };
        if removed {
            info!(profile = %id, "Profile removed");
            let _ = self.ctx.events.send(ProfileEvent::Removed { id: id.clone() });
        }
    }
}

/// Concurrency-safe collection of all active profiles.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct ProfileRegistry {
    inner: Arc<Inner>,
}

impl ProfileRegistry {
    /// Create an empty registry in the `Starting` phase.
    pub fn new(launcher: Arc<dyn Launcher>, cleaner: NetworkCleaner, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (active, _) = watch::channel(0);
        let ctx = MachineContext {
            launcher,
            cleaner,
            events,
            default_grace: config.stop_grace,
        };
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    phase: RegistryPhase::Starting,
                    entries: HashMap::new(),
                    next_generation: 0,
                }),
                ctx,
                config,
                active,
            }),
        }
    }

    pub fn phase(&self) -> RegistryPhase {
        self.inner.lock().phase
    }

    /// Start accepting profiles. No effect once shutting down.
    pub fn open(&self) {
        let mut table = self.inner.lock();
        if table.phase == RegistryPhase::Starting {
            table.phase = RegistryPhase::Accepting;
            info!("Profile registry accepting");
        }
    }

    /// Stop accepting profiles for good.
    pub fn close(&self) {
        self.inner.lock().phase = RegistryPhase::ShuttingDown;
    }

    pub fn cleaner(&self) -> &NetworkCleaner {
        &self.inner.ctx.cleaner
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Start a profile. Returns as soon as its machine is spawned.
    pub fn add(&self, profile: Profile) -> Result<(), RegistryError> {
        profile.validate()?;
        let policy = profile
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.config.retry.clone());
        let id = profile.id.clone();

        let (machine, handle) =
            ProfileStateMachine::new(profile.clone(), policy, self.inner.ctx.clone());
        let (done_tx, done) = watch::channel(false);

        let generation = {
            let mut table = self.inner.lock();
            match table.phase {
                RegistryPhase::Starting => return Err(RegistryError::NotReady),
                RegistryPhase::ShuttingDown => return Err(RegistryError::ShuttingDown),
                RegistryPhase::Accepting => {}
            }
            if table.entries.contains_key(&id) {
                return Err(RegistryError::AlreadyActive(id));
            }
            table.next_generation += 1;
            let generation = table.next_generation;
            table.entries.insert(
                id.clone(),
                Entry {
                    profile,
                    generation,
                    handle: handle.clone(),
                    done,
                },
            );
            self.inner.active.send_replace(table.entries.len());
            generation
        };

        info!(profile = %id, "Profile added");
        let inner = self.inner.clone();
        let last_record = handle.watch();
        tokio::spawn(async move {
            let worker = tokio::spawn(machine.run());
            match worker.await {
                Ok(record) => debug!(profile = %id, "Profile worker finished in {}", record.state),
                Err(e) => {
                    error!(profile = %id, "Profile worker panicked: {}", e);
                    let last = last_record.borrow().network_override.clone();
                    if let Some(record) = last {
                        let _ = inner.ctx.cleaner.rollback_override(&record).await;
                    }
                }
            }
            inner.finish(&id, generation);
            let _ = done_tx.send(true);
        });
        Ok(())
    }

    /// Request a stop. The entry disappears once the profile is fully down.
    pub fn remove(&self, id: &ProfileId) -> Result<(), RegistryError> {
        let handle = self
            .inner
            .lock()
            .entries
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        info!(profile = %id, "Stopping profile");
        handle.stop(self.inner.config.stop_grace);
        Ok(())
    }

    /// Snapshots of all records, sorted by id.
    pub fn list(&self) -> Vec<RuntimeRecord> {
        let mut records: Vec<RuntimeRecord> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|e| e.handle.snapshot())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn get(&self, id: &ProfileId) -> Option<RuntimeRecord> {
        self.inner.lock().entries.get(id).map(|e| e.handle.snapshot())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifecycle events of all profiles.
    pub fn subscribe(&self) -> broadcast::Receiver<ProfileEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// Request a stop on every entry. Returns the number signalled.
    pub fn stop_all(&self, grace: Duration) -> usize {
        let handles: Vec<MachineHandle> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|e| e.handle.clone())
            .collect();
        for handle in &handles {
            handle.stop(grace);
        }
        handles.len()
    }

    /// Wait until the registry is empty.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Stop every profile, wait for each to be fully down, then start
    /// each again with its original configuration.
    ///
    /// Non-graceful restarts kill tunnel processes without waiting.
    /// Returns the number of profiles started again.
    pub async fn restart_all(&self, graceful: bool) -> usize {
        let grace = if graceful {
            self.inner.config.stop_grace
        } else {
            Duration::ZERO
        };
        let targets: Vec<(Profile, MachineHandle, watch::Receiver<bool>)> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|e| (e.profile.clone(), e.handle.clone(), e.done.clone()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        info!("Restarting {} profile(s) (graceful: {})", targets.len(), graceful);
        for (_, handle, _) in &targets {
            handle.stop(grace);
        }

        let mut profiles = Vec::with_capacity(targets.len());
        for (profile, _, mut done) in targets {
            let _ = done.wait_for(|d| *d).await;
            profiles.push(profile);
        }

        let mut restarted = 0;
        for profile in profiles {
            let id = profile.id.clone();
            match self.add(profile) {
                Ok(()) => restarted += 1,
                Err(RegistryError::AlreadyActive(_)) => {
                    debug!(profile = %id, "Already started again by someone else")
                }
                Err(e) => warn!(profile = %id, "Restart failed: {}", e),
            }
        }
        restarted
    }
}
