//! Tunnel program launcher.
//!
//! Starts the configured external program with an argument template,
//! pipes its stdout and stderr into one line channel, and wraps the
//! child so the supervisor can terminate it.

use crate::profile::Profile;
use crate::supervisor::{LaunchedProcess, Launcher, SpawnError, TunnelProcess};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered output lines per process.
const OUTPUT_BUFFER: usize = 256;

/// Which program to run and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub program: PathBuf,
    /// Argument template; `{config}`, `{server}` and `{id}` are substituted
    pub args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("openvpn"),
            args: vec!["--config".to_string(), "{config}".to_string()],
        }
    }
}

/// [`Launcher`] backed by real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: LauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Full argument list for a profile.
    pub fn render_args(&self, profile: &Profile) -> Result<Vec<String>, SpawnError> {
        let config_path = profile
            .config_path
            .as_ref()
            .map(|p| p.display().to_string());

        let mut args = Vec::with_capacity(self.config.args.len() + profile.args.len());
        for arg in &self.config.args {
            if arg.contains("{config}") && config_path.is_none() {
                return Err(SpawnError::Config(format!(
                    "profile {} has no config_path",
                    profile.id
                )));
            }
            args.push(
                arg.replace("{config}", config_path.as_deref().unwrap_or_default())
                    .replace("{server}", &profile.server)
                    .replace("{id}", profile.id.as_str()),
            );
        }
        args.extend(profile.routing.program_args());
        args.extend(profile.args.iter().cloned());
        Ok(args)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, profile: &Profile) -> Result<LaunchedProcess, SpawnError> {
        if let Some(path) = &profile.config_path {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(SpawnError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
        }
        let args = self.render_args(profile)?;
        debug!(profile = %profile.id, "exec: {} {}", self.config.program.display(), args.join(" "));

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(LaunchedProcess {
            process: Box::new(ChildProcess { child }),
            output: rx,
        })
    }
}

/// Forward output line by line until EOF. Invalid UTF-8 is replaced
/// rather than ending the stream, so the pipe keeps draining.
async fn forward_lines(stream: impl AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "tunnel output stream closed");
                break;
            }
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileId;

    fn profile() -> Profile {
        let mut profile = Profile::new(ProfileId::new("office").unwrap(), "vpn.example.com");
        profile.config_path = Some(PathBuf::from("/etc/tund/office.ovpn"));
        profile.args = vec!["--verb".to_string(), "3".to_string()];
        profile
    }

    #[test]
    fn test_render_args() {
        let launcher = ProcessLauncher::new(LauncherConfig {
            program: PathBuf::from("openvpn"),
            args: vec![
                "--config".to_string(),
                "{config}".to_string(),
                "--remote".to_string(),
                "{server}".to_string(),
                "--setenv".to_string(),
                "TUND_PROFILE={id}".to_string(),
            ],
        });
        let mut profile = profile();
        profile.routing.block_ipv6 = true;

        assert_eq!(
            launcher.render_args(&profile).unwrap(),
            vec![
                "--config",
                "/etc/tund/office.ovpn",
                "--remote",
                "vpn.example.com",
                "--setenv",
                "TUND_PROFILE=office",
                "--block-ipv6",
                "--verb",
                "3"
            ]
        );
    }

    #[test]
    fn test_missing_config_path() {
        let launcher = ProcessLauncher::default();
        let mut profile = profile();
        profile.config_path = None;
        assert!(matches!(
            launcher.render_args(&profile),
            Err(SpawnError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_config_file_is_fatal() {
        let launcher = ProcessLauncher::default();
        let mut profile = profile();
        profile.config_path = Some(PathBuf::from("/nonexistent/tund/none.ovpn"));
        let err = launcher.launch(&profile).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_output_and_exit() {
        let launcher = ProcessLauncher::new(LauncherConfig {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "echo 'TUN/TAP device tun9 opened'; echo 'Initialization Sequence Completed' >&2; exit 4"
                    .to_string(),
            ],
        });
        let mut profile = profile();
        profile.config_path = None;
        profile.args.clear();

        let LaunchedProcess { mut process, mut output } = launcher.launch(&profile).await.unwrap();
        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        assert_eq!(process.wait().await.unwrap(), Some(4));
        lines.sort();
        assert_eq!(
            lines,
            vec!["Initialization Sequence Completed", "TUN/TAP device tun9 opened"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_output() {
        let launcher = ProcessLauncher::new(LauncherConfig {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "printf 'bad \\377 byte\\r\\n'; echo 'Initialization Sequence Completed'".to_string(),
            ],
        });
        let mut profile = profile();
        profile.config_path = None;
        profile.args.clear();

        let LaunchedProcess { mut process, mut output } = launcher.launch(&profile).await.unwrap();
        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        assert_eq!(process.wait().await.unwrap(), Some(0));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "bad \u{FFFD} byte");
        assert_eq!(lines[1], "Initialization Sequence Completed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_real_process() {
        let launcher = ProcessLauncher::new(LauncherConfig {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
        });
        let mut profile = profile();
        profile.config_path = None;
        profile.args.clear();

        let LaunchedProcess { mut process, .. } = launcher.launch(&profile).await.unwrap();
        process.terminate().unwrap();
        // Killed by SIGTERM: no exit code
        assert_eq!(process.wait().await.unwrap(), None);
    }
}
