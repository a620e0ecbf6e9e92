//! Service configuration
//!
//! Loaded once at startup from a TOML file. Every table is optional;
//! durations are milliseconds.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tund_net::CleanerConfig;
use tund_profile::{LauncherConfig, RegistryConfig, RetryPolicy};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tund/tund.toml";

/// Default loopback port for the TCP control endpoint.
pub const DEFAULT_CONTROL_PORT: u16 = 9770;

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Holds the PID marker and per-profile runtime files
    pub runtime_dir: PathBuf,
    pub control: ControlConfig,
    pub tunnel: TunnelConfig,
    pub retry: RetryPolicy,
    pub shutdown: ShutdownConfig,
    pub network: NetworkConfig,
    pub watch: WatchConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            control: ControlConfig::default(),
            tunnel: TunnelConfig::default(),
            retry: RetryPolicy::default(),
            shutdown: ShutdownConfig::default(),
            network: NetworkConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

fn default_runtime_dir() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/run/tund")
    } else {
        std::env::temp_dir().join("tund")
    }
}

/// How the control API is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Unix,
    Tcp,
}

impl Default for Transport {
    fn default() -> Self {
        if cfg!(unix) { Transport::Unix } else { Transport::Tcp }
    }
}

/// `[control]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub transport: Transport,
    pub socket_path: PathBuf,
    pub tcp_addr: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            socket_path: PathBuf::from("/var/run/tund.sock"),
            tcp_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CONTROL_PORT),
        }
    }
}

/// `[tunnel]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel-establishing program
    pub program: PathBuf,
    /// Argument template, see [`LauncherConfig`]
    pub args: Vec<String>,
    /// Grace before a stopping tunnel is killed
    pub stop_grace_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let launcher = LauncherConfig::default();
        Self {
            program: launcher.program,
            args: launcher.args,
            stop_grace_ms: 5_000,
        }
    }
}

/// `[shutdown]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for in-flight control requests
    pub server_deadline_ms: u64,
    /// Pause after the server and watchers stop
    pub settle_ms: u64,
    /// How long to wait for every profile to disconnect
    pub drain_grace_ms: u64,
    /// How long to wait for force-killed profiles once the drain grace expires
    pub kill_wait_ms: u64,
    /// Pause after the final network cleanup
    pub final_settle_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            server_deadline_ms: 1_000,
            settle_ms: 250,
            drain_grace_ms: 10_000,
            kill_wait_ms: 2_000,
            final_settle_ms: 750,
        }
    }
}

impl ShutdownConfig {
    pub fn server_deadline(&self) -> Duration {
        Duration::from_millis(self.server_deadline_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn final_settle(&self) -> Duration {
        Duration::from_millis(self.final_settle_ms)
    }
}

/// `[network]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Skip the startup network reset after an unclean exit
    pub disable_net_clean: bool,
    /// Interface name prefixes treated as tunnel leftovers
    pub interface_prefixes: Vec<String>,
    /// Bound on every startup host query
    pub query_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            disable_net_clean: false,
            interface_prefixes: CleanerConfig::default().interface_prefixes,
            query_timeout_ms: 5_000,
        }
    }
}

/// `[watch]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory of system-wide profile files; `None` disables the watcher
    pub profiles_dir: Option<PathBuf>,
    pub interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            profiles_dir: cfg!(unix).then(|| PathBuf::from("/etc/tund/profiles")),
            interval_ms: 5_000,
        }
    }
}

impl ServiceConfig {
    /// Parse from TOML.
    pub fn from_toml(content: &str) -> Result<Self, ServiceError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .map_err(|e| ServiceError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ServiceError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        self.retry
            .validate()
            .map_err(|reason| ServiceError::Config(format!("[retry]: {}", reason)))?;
        if self.watch.interval_ms == 0 {
            return Err(ServiceError::Config("[watch]: interval_ms must be positive".into()));
        }
        if self.runtime_dir.as_os_str().is_empty() {
            return Err(ServiceError::Config("runtime_dir must not be empty".into()));
        }
        Ok(())
    }

    /// PID file recording the running instance.
    pub fn marker_path(&self) -> PathBuf {
        self.runtime_dir.join("tund.pid")
    }

    /// Per-profile runtime files.
    pub fn profiles_runtime_dir(&self) -> PathBuf {
        self.runtime_dir.join("profiles")
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.network.query_timeout_ms)
    }

    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            program: self.tunnel.program.clone(),
            args: self.tunnel.args.clone(),
        }
    }

    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            interface_prefixes: self.network.interface_prefixes.clone(),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            retry: self.retry.clone(),
            stop_grace: Duration::from_millis(self.tunnel.stop_grace_ms),
            ..RegistryConfig::default()
        }
    }
}
