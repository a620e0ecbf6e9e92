//! Process supervisor
//!
//! Runs one tunnel process for one attempt: starts it through a
//! [`Launcher`], reads its output for status markers, forwards the
//! ones the state machine cares about, handles graceful-then-forced
//! termination, and produces a classified [`ExitReport`] when the
//! process is gone.

use crate::profile::{Profile, ProfileId};
use crate::status::{StatusMarker, StatusTracker};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use tund_net::NetworkOverride;

/// Output lines kept for the exit report.
const LAST_LINES: usize = 32;

/// How long to keep reading output after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a start attempt could not produce a process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The profile can never start as configured
    #[error("Invalid tunnel configuration: {0}")]
    Config(String),

    /// The OS refused to start the process
    #[error("Failed to start tunnel process: {0}")]
    Io(#[from] io::Error),
}

impl SpawnError {
    /// Fatal errors are not retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SpawnError::Config(_))
    }
}

/// A running tunnel process.
#[async_trait]
pub trait TunnelProcess: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit.
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for exit and return the exit code (None if killed by a signal).
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// A freshly started process and its merged stdout/stderr lines.
pub struct LaunchedProcess {
    pub process: Box<dyn TunnelProcess>,
    pub output: mpsc::Receiver<String>,
}

/// Starts tunnel processes for profiles.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, profile: &Profile) -> Result<LaunchedProcess, SpawnError>;
}

/// Events forwarded to the owning state machine while the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Tunnel established; carries host changes seen so far
    Connected(NetworkOverride),
    /// More host changes seen after Connected
    OverrideUpdated(NetworkOverride),
    /// Follows Connected when the tunnel reported setup errors; carries the line
    SetupErrors(String),
    /// Credentials rejected; carries the offending line
    AuthFailed(String),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    /// Exit after a stop request
    Normal,
    /// Credentials rejected; not retried
    AuthFailure,
    /// Recognized network problem; retried
    NetworkFailure,
    /// No recognizable cause; retried with a longer backoff
    Unknown,
}

/// Final account of one process.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub class: ExitClass,
    pub last_lines: Vec<String>,
    /// Host changes seen, possibly partial
    pub observed: NetworkOverride,
    pub connected: bool,
    pub stop_requested: bool,
}

impl ExitReport {
    fn lost() -> Self {
        Self {
            code: None,
            class: ExitClass::Unknown,
            last_lines: Vec::new(),
            observed: NetworkOverride::new(),
            connected: false,
            stop_requested: false,
        }
    }
}

/// Handle to a supervised process.
///
/// Dropping the handle kills the process.
pub struct SupervisorHandle {
    pid: Option<u32>,
    stop_tx: mpsc::UnboundedSender<Duration>,
    exit_rx: oneshot::Receiver<ExitReport>,
    report: Option<ExitReport>,
}

impl SupervisorHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination; force it after `grace`. Zero grace kills
    /// immediately. Returns without waiting.
    pub fn stop(&self, grace: Duration) {
        let _ = self.stop_tx.send(grace);
    }

    /// Wait for the process to exit. Cancel safe, and may be called
    /// again after it returned.
    pub async fn wait(&mut self) -> ExitReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let report = match (&mut self.exit_rx).await {
            Ok(report) => report,
            Err(_) => {
                warn!("Supervisor task ended without an exit report");
                ExitReport::lost()
            }
        };
        self.report = Some(report.clone());
        report
    }
}

/// Spawns and monitors tunnel processes.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Start a process for `profile` and monitor it in a background task.
    pub async fn spawn(
        launcher: &dyn Launcher,
        profile: &Profile,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<SupervisorHandle, SpawnError> {
        let LaunchedProcess { process, output } = launcher.launch(profile).await?;
        let pid = process.id();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        info!(profile = %profile.id, pid = ?pid, "Tunnel process started");

        let monitor = Monitor {
            id: profile.id.clone(),
            process,
            output,
            stop_rx,
            events,
            tracker: StatusTracker::new(LAST_LINES),
            stop_requested: false,
        };
        tokio::spawn(async move {
            let report = monitor.run().await;
            let _ = exit_tx.send(report);
        });

        Ok(SupervisorHandle {
            pid,
            stop_tx,
            exit_rx,
            report: None,
        })
    }
}

struct Monitor {
    id: ProfileId,
    process: Box<dyn TunnelProcess>,
    output: mpsc::Receiver<String>,
    stop_rx: mpsc::UnboundedReceiver<Duration>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    tracker: StatusTracker,
    stop_requested: bool,
}

impl Monitor {
    async fn run(mut self) -> ExitReport {
        let mut kill_deadline: Option<Instant> = None;
        let mut output_open = true;
        let mut stop_open = true;

        let code = loop {
            tokio::select! {
                status = self.process.wait() => {
                    break match status {
                        Ok(code) => code,
                        Err(e) => {
                            warn!(profile = %self.id, "Waiting for tunnel process failed: {}", e);
                            None
                        }
                    };
                }
                line = self.output.recv(), if output_open => match line {
                    Some(line) => self.handle_line(&line),
                    None => output_open = false,
                },
                grace = self.stop_rx.recv(), if stop_open => {
                    let grace = match grace {
                        Some(grace) => grace,
                        None => {
                            // Handle dropped: nobody will wait for this process
                            stop_open = false;
                            Duration::ZERO
                        }
                    };
                    kill_deadline = self.request_stop(grace, kill_deadline);
                }
                _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                    warn!(profile = %self.id, "Tunnel process ignored termination, killing");
                    self.force_kill();
                    kill_deadline = None;
                }
            }
        };

        if output_open {
            let drain = async {
                while let Some(line) = self.output.recv().await {
                    self.handle_line(&line);
                }
            };
            if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                debug!(profile = %self.id, "Output still open after exit, giving up on it");
            }
        }

        let class = self.classify();
        info!(profile = %self.id, code = ?code, class = ?class, "Tunnel process exited");
        ExitReport {
            code,
            class,
            last_lines: self.tracker.last_lines(),
            observed: self.tracker.observed().clone(),
            connected: self.tracker.is_connected(),
            stop_requested: self.stop_requested,
        }
    }

    /// Returns the new kill deadline.
    fn request_stop(&mut self, grace: Duration, current: Option<Instant>) -> Option<Instant> {
        self.stop_requested = true;
        if grace.is_zero() {
            self.force_kill();
            return None;
        }
        if current.is_none() {
            debug!(profile = %self.id, "Terminating tunnel process (grace {:?})", grace);
            if let Err(e) = self.process.terminate() {
                warn!(profile = %self.id, "Termination request failed: {}", e);
            }
        }
        let deadline = Instant::now() + grace;
        Some(current.map_or(deadline, |d| d.min(deadline)))
    }

    fn force_kill(&mut self) {
        if let Err(e) = self.process.kill() {
            debug!(profile = %self.id, "Kill failed (already gone?): {}", e);
        }
    }

    fn handle_line(&mut self, line: &str) {
        debug!(profile = %self.id, "tunnel: {}", line);
        let was_connected = self.tracker.is_connected();
        for marker in self.tracker.observe(line) {
            let event = match marker {
                StatusMarker::Connected if !was_connected => {
                    ProcessEvent::Connected(self.tracker.observed().clone())
                }
                StatusMarker::ConnectedWithErrors if !was_connected => {
                    let _ = self
                        .events
                        .send(ProcessEvent::Connected(self.tracker.observed().clone()));
                    ProcessEvent::SetupErrors(line.to_string())
                }
                StatusMarker::AuthFailed => ProcessEvent::AuthFailed(line.to_string()),
                StatusMarker::Interface(_)
                | StatusMarker::Dns(_)
                | StatusMarker::SearchDomain(_)
                | StatusMarker::Route(_)
                    if was_connected =>
                {
                    ProcessEvent::OverrideUpdated(self.tracker.observed().clone())
                }
                _ => continue,
            };
            let _ = self.events.send(event);
        }
    }

    fn classify(&self) -> ExitClass {
        if self.tracker.auth_failed() {
            ExitClass::AuthFailure
        } else if self.stop_requested {
            ExitClass::Normal
        } else if self.tracker.network_error() {
            ExitClass::NetworkFailure
        } else {
            ExitClass::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedLauncher};
    use tund_net::testing::Journal;

    fn profile(id: &str) -> Profile {
        Profile::new(ProfileId::new(id).unwrap(), "vpn.example.com")
    }

    #[tokio::test]
    async fn test_connected_event_carries_override() {
        let launcher = ScriptedLauncher::new(Journal::new(), Script::connects("tun0"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();
        assert!(handle.pid().is_some());

        let Some(ProcessEvent::Connected(observed)) = rx.recv().await else {
            panic!("expected connected event");
        };
        assert_eq!(observed.interface.as_deref(), Some("tun0"));
        assert!(!observed.routes.is_empty());

        handle.stop(Duration::from_secs(1));
        let report = handle.wait().await;
        assert_eq!(report.class, ExitClass::Normal);
        assert!(report.connected);
        assert!(report.stop_requested);
        assert_eq!(report.observed, observed);
    }

    #[tokio::test]
    async fn test_network_failure_classified() {
        let launcher = ScriptedLauncher::new(Journal::new(), Script::fails_network());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();

        let report = handle.wait().await;
        assert_eq!(report.class, ExitClass::NetworkFailure);
        assert_eq!(report.code, Some(1));
        assert!(!report.connected);
        assert!(report.last_lines.iter().any(|l| l.contains("Connection refused")));

        // A second wait returns the cached report
        assert_eq!(handle.wait().await.code, Some(1));
    }

    #[tokio::test]
    async fn test_auth_failure_wins_over_stop() {
        let launcher = ScriptedLauncher::new(Journal::new(), Script::fails_auth().holding());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ProcessEvent::AuthFailed(_))));
        handle.stop(Duration::from_secs(1));
        assert_eq!(handle.wait().await.class, ExitClass::AuthFailure);
    }

    #[tokio::test]
    async fn test_unknown_exit() {
        let launcher = ScriptedLauncher::new(Journal::new(), Script::new(vec!["starting"]).exits(3));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();
        let report = handle.wait().await;
        assert_eq!(report.class, ExitClass::Unknown);
        assert_eq!(report.code, Some(3));
    }

    #[tokio::test]
    async fn test_kill_after_grace() {
        let journal = Journal::new();
        let launcher =
            ScriptedLauncher::new(journal.clone(), Script::connects("tun0").ignoring_term());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Connected(_))));

        handle.stop(Duration::from_millis(50));
        let report = handle.wait().await;
        assert_eq!(report.class, ExitClass::Normal);
        assert_eq!(journal.count("process:term:a"), 1);
        assert_eq!(journal.count("process:kill:a"), 1);
    }

    #[tokio::test]
    async fn test_zero_grace_kills_immediately() {
        let journal = Journal::new();
        let launcher = ScriptedLauncher::new(journal.clone(), Script::connects("tun0"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();

        handle.stop(Duration::ZERO);
        handle.wait().await;
        assert_eq!(journal.count("process:term:a"), 0);
        assert_eq!(journal.count("process:kill:a"), 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_kills() {
        let journal = Journal::new();
        let launcher = ScriptedLauncher::new(journal.clone(), Script::connects("tun0"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .unwrap();
        drop(handle);

        let id = ProfileId::new("a").unwrap();
        for _ in 0..100 {
            if launcher.live(&id) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(launcher.live(&id), 0);
    }

    #[tokio::test]
    async fn test_config_error_is_fatal() {
        let launcher = ScriptedLauncher::new(Journal::new(), Script::connects("tun0"));
        let id = ProfileId::new("a").unwrap();
        launcher.fail_config(&id);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ProcessSupervisor::spawn(&launcher, &profile("a"), tx)
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
