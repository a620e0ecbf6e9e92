//! Profile state machine
//!
//! One task per active profile. The machine owns the profile's
//! runtime record and its current [`SupervisorHandle`], decides
//! between reconnecting and giving up, and rolls back the profile's
//! host changes before it reports `Disconnected`.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Connected
//!                   │  ▲  │         │
//!                   │  │  ▼         ▼
//!                   │ Reconnecting ◀┘
//!                   ▼      │
//!              Disconnecting ◀──────┘ (stop, budget exhausted, auth/config error)
//!                   │
//!                   ▼
//!              Disconnected
//! ```

use crate::error::ErrorKind;
use crate::profile::Profile;
use crate::retry::RetryPolicy;
use crate::state::{unix_now, ErrorRecord, ProfileEvent, ProfileState, RuntimeRecord};
use crate::supervisor::{ExitClass, Launcher, ProcessEvent, ProcessSupervisor, SupervisorHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use tund_net::{NetworkCleaner, NetworkOverride};

/// Requests accepted by a running machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineCommand {
    /// Stop the tunnel; force-kill after `grace`
    Stop { grace: Duration },
}

/// Dependencies shared by all machines.
#[derive(Clone)]
pub struct MachineContext {
    pub launcher: Arc<dyn Launcher>,
    pub cleaner: NetworkCleaner,
    pub events: broadcast::Sender<ProfileEvent>,
    /// Grace used when a stop comes from anything but an explicit command
    pub default_grace: Duration,
}

/// Control and observation side of a machine.
#[derive(Clone)]
pub struct MachineHandle {
    commands: mpsc::UnboundedSender<MachineCommand>,
    record: watch::Receiver<RuntimeRecord>,
}

impl MachineHandle {
    /// Request a stop. Returns false if the machine already finished.
    pub fn stop(&self, grace: Duration) -> bool {
        self.commands.send(MachineCommand::Stop { grace }).is_ok()
    }

    pub fn snapshot(&self) -> RuntimeRecord {
        self.record.borrow().clone()
    }

    /// Receiver that sees every published record.
    pub fn watch(&self) -> watch::Receiver<RuntimeRecord> {
        self.record.clone()
    }
}

/// Outcome of one process run.
enum Attempt {
    /// Exited after a stop request
    Stopped(NetworkOverride),
    /// Exited on its own
    Failed {
        class: ExitClass,
        observed: NetworkOverride,
        detail: String,
    },
    /// Cannot be started as configured
    Fatal(ErrorRecord),
}

/// Per-profile lifecycle driver.
pub struct ProfileStateMachine {
    profile: Profile,
    policy: RetryPolicy,
    ctx: MachineContext,
    record: RuntimeRecord,
    record_tx: watch::Sender<RuntimeRecord>,
    commands: mpsc::UnboundedReceiver<MachineCommand>,
    commands_open: bool,
    /// Set once a stop was requested; never cleared
    stop_grace: Option<Duration>,
}

impl ProfileStateMachine {
    pub fn new(profile: Profile, policy: RetryPolicy, ctx: MachineContext) -> (Self, MachineHandle) {
        let record = RuntimeRecord::new(&profile);
        let (record_tx, record_rx) = watch::channel(record.clone());
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let machine = Self {
            profile,
            policy,
            ctx,
            record,
            record_tx,
            commands,
            commands_open: true,
            stop_grace: None,
        };
        let handle = MachineHandle {
            commands: commands_tx,
            record: record_rx,
        };
        (machine, handle)
    }

    /// Drive the profile until it is back in `Disconnected`.
    ///
    /// Returns the final record.
    pub async fn run(mut self) -> RuntimeRecord {
        self.transition(ProfileState::Connecting);
        let mut leftover = NetworkOverride::new();

        loop {
            if self.stop_pending() {
                break;
            }
            match self.attempt().await {
                Attempt::Stopped(observed) => {
                    leftover = observed;
                    break;
                }
                Attempt::Fatal(error) => {
                    self.fail(error);
                    break;
                }
                Attempt::Failed {
                    class: ExitClass::AuthFailure,
                    observed,
                    detail,
                } => {
                    self.fail(ErrorRecord::new(ErrorKind::AuthFailure, detail));
                    leftover = observed;
                    break;
                }
                Attempt::Failed {
                    class,
                    observed,
                    detail,
                } => {
                    // Whatever the dead process left must not survive into the next attempt
                    self.rollback(observed).await;

                    if self.stop_grace.is_some() {
                        break;
                    }
                    if !self.policy.allows(self.record.reconnect_attempts) {
                        self.fail(ErrorRecord::new(
                            ErrorKind::TransientNetwork,
                            format!(
                                "giving up after {} retries: {}",
                                self.record.reconnect_attempts, detail
                            ),
                        ));
                        break;
                    }

                    self.record.reconnect_attempts += 1;
                    let delay = self.policy.delay(self.record.reconnect_attempts, class);
                    warn!(
                        profile = %self.profile.id,
                        attempt = self.record.reconnect_attempts,
                        max = self.policy.max_retries,
                        "Tunnel exited ({:?}: {}), reconnecting in {:?}",
                        class,
                        detail,
                        delay
                    );
                    self.transition(ProfileState::Reconnecting);
                    if !self.backoff(delay).await {
                        break;
                    }
                    self.transition(ProfileState::Connecting);
                }
            }
        }

        self.teardown(leftover).await;
        self.record
    }

    /// Spawn one process and follow it until it exits.
    async fn attempt(&mut self) -> Attempt {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let spawned =
            ProcessSupervisor::spawn(self.ctx.launcher.as_ref(), &self.profile, events_tx).await;
        let mut handle = match spawned {
            Ok(handle) => handle,
            Err(e) if e.is_fatal() => {
                return Attempt::Fatal(ErrorRecord::new(ErrorKind::Config, e.to_string()));
            }
            Err(e) => {
                return Attempt::Failed {
                    class: ExitClass::NetworkFailure,
                    observed: NetworkOverride::new(),
                    detail: e.to_string(),
                };
            }
        };
        self.record.pid = handle.pid();
        self.publish();

        let report = loop {
            tokio::select! {
                biased;
                command = self.commands.recv(), if self.commands_open => {
                    let grace = self.on_command(command);
                    if matches!(self.record.state, ProfileState::Connecting | ProfileState::Connected) {
                        self.transition(ProfileState::Disconnecting);
                    }
                    handle.stop(grace);
                }
                Some(event) = events_rx.recv() => self.on_process_event(event, &handle),
                report = handle.wait() => break report,
            }
        };
        self.record.pid = None;

        if self.stop_grace.is_some() || report.class == ExitClass::Normal {
            return Attempt::Stopped(report.observed);
        }
        let detail = report
            .last_lines
            .last()
            .cloned()
            .unwrap_or_else(|| format!("exit code {:?}", report.code));
        Attempt::Failed {
            class: report.class,
            observed: report.observed,
            detail,
        }
    }

    fn on_process_event(&mut self, event: ProcessEvent, handle: &SupervisorHandle) {
        match event {
            ProcessEvent::Connected(observed) => {
                if self.record.state != ProfileState::Connecting {
                    // Stop already requested; the exit report still carries the override
                    return;
                }
                self.record.interface = observed.interface.clone();
                self.record.network_override = Some(observed);
                self.record.reconnect_attempts = 0;
                self.record.started_at = Some(unix_now());
                self.record.last_error = None;
                self.transition(ProfileState::Connected);
            }
            ProcessEvent::OverrideUpdated(observed) => {
                if self.record.state == ProfileState::Connected {
                    self.record.interface = observed.interface.clone();
                    self.record.network_override = Some(observed);
                    self.publish();
                }
            }
            ProcessEvent::SetupErrors(line) => {
                if self.record.state == ProfileState::Connected {
                    self.fail(ErrorRecord::new(
                        ErrorKind::Platform,
                        format!("connected with errors: {}", line),
                    ));
                }
            }
            ProcessEvent::AuthFailed(line) => {
                warn!(profile = %self.profile.id, "Authentication failed: {}", line);
                handle.stop(self.ctx.default_grace);
            }
        }
    }

    /// Record a stop request; returns the grace to use.
    fn on_command(&mut self, command: Option<MachineCommand>) -> Duration {
        let grace = match command {
            Some(MachineCommand::Stop { grace }) => grace,
            None => {
                debug!(profile = %self.profile.id, "Command channel closed, stopping");
                self.commands_open = false;
                self.ctx.default_grace
            }
        };
        let grace = self.stop_grace.map_or(grace, |g| g.min(grace));
        self.stop_grace = Some(grace);
        grace
    }

    /// Check for a stop queued while nothing was running.
    fn stop_pending(&mut self) -> bool {
        if self.stop_grace.is_some() {
            return true;
        }
        match self.commands.try_recv() {
            Ok(command) => {
                self.on_command(Some(command));
                true
            }
            Err(TryRecvError::Disconnected) => {
                self.on_command(None);
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Wait out a reconnect delay. Returns false if stopped meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            command = self.commands.recv(), if self.commands_open => {
                self.on_command(command);
                debug!(profile = %self.profile.id, "Stop during backoff, cancelling reconnect");
                false
            }
        }
    }

    fn fail(&mut self, error: ErrorRecord) {
        error!(profile = %self.profile.id, kind = ?error.kind, "{}", error.message);
        self.record.last_error = Some(error.clone());
        self.publish();
        let _ = self.ctx.events.send(ProfileEvent::Error {
            id: self.profile.id.clone(),
            error,
        });
    }

    /// Undo the recorded override plus anything observed after it.
    async fn rollback(&mut self, observed: NetworkOverride) {
        let mut target = self.record.network_override.take().unwrap_or_default();
        target.merge(observed);
        self.record.interface = None;
        if let Err(e) = self.ctx.cleaner.rollback_override(&target).await {
            warn!(profile = %self.profile.id, "Network rollback incomplete: {}", e);
        }
        self.publish();
    }

    async fn teardown(&mut self, leftover: NetworkOverride) {
        self.transition(ProfileState::Disconnecting);
        self.rollback(leftover).await;
        self.record.pid = None;
        self.record.started_at = None;
        self.transition(ProfileState::Disconnected);
    }

    fn transition(&mut self, to: ProfileState) {
        let from = self.record.state;
        if from == to {
            return;
        }
        debug_assert!(from.can_transition_to(to), "invalid transition {} -> {}", from, to);
        self.record.state = to;
        info!(profile = %self.profile.id, "{} -> {}", from, to);
        self.publish();
        let _ = self.ctx.events.send(ProfileEvent::StateChanged {
            id: self.profile.id.clone(),
            from,
            to,
        });
    }

    fn publish(&self) {
        self.record_tx.send_replace(self.record.clone());
    }
}
