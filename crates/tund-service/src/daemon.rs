//! Daemon composition
//!
//! Startup order: runtime directories, startup reconciliation (which
//! writes the run marker and opens the registry), control server, then
//! the system profile watcher. Shutdown runs in reverse through
//! [`ShutdownCoordinator`].

use crate::autoclean::{AutoClean, AutoCleanReport};
use crate::config::ServiceConfig;
use crate::control::{self, ControlState};
use crate::error::ServiceError;
use crate::marker::RunMarker;
use crate::server::{self, Endpoint};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::watch::SystemProfileWatcher;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tund_net::{NetworkCleaner, Platform};
use tund_profile::{Launcher, ProfileRegistry};

/// A running service.
pub struct Daemon {
    registry: ProfileRegistry,
    endpoint: Endpoint,
    startup: AutoCleanReport,
    coordinator: ShutdownCoordinator,
}

impl Daemon {
    /// Bring the service up. Any error here is fatal.
    pub async fn start(
        config: ServiceConfig,
        platform: Arc<dyn Platform>,
        launcher: Arc<dyn Launcher>,
        dev: bool,
    ) -> Result<Self, ServiceError> {
        tokio::fs::create_dir_all(&config.runtime_dir).await?;

        let cleaner = NetworkCleaner::new(platform, config.cleaner_config());
        info!("Using {} network platform", cleaner.platform_name());
        let registry = ProfileRegistry::new(launcher, cleaner.clone(), config.registry_config());
        let marker = RunMarker::new(config.marker_path());

        let startup = AutoClean::new(cleaner, marker.clone(), config.profiles_runtime_dir())
            .disable_net_clean(config.network.disable_net_clean)
            .query_timeout(config.query_timeout())
            .run(&registry)
            .await?;

        let state = Arc::new(ControlState {
            registry: registry.clone(),
            dev,
        });
        let server = match server::serve(&Endpoint::from_config(&config.control), control::router(state)).await {
            Ok(server) => server,
            Err(e) => {
                let _ = marker.release().await;
                return Err(e);
            }
        };
        let endpoint = server.endpoint().clone();

        let mut coordinator =
            ShutdownCoordinator::new(registry.clone(), marker, config.shutdown.clone()).with_server(server);
        if let Some(dir) = &config.watch.profiles_dir {
            let watcher = SystemProfileWatcher::new(
                dir,
                Duration::from_millis(config.watch.interval_ms),
                registry.clone(),
            );
            coordinator = coordinator.with_watcher(watcher.spawn());
        }

        info!("Service started (pid {})", std::process::id());
        Ok(Self {
            registry,
            endpoint,
            startup,
            coordinator,
        })
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Where the control API is listening.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// What startup reconciliation found.
    pub fn startup_report(&self) -> &AutoCleanReport {
        &self.startup
    }

    /// Stop everything and clean up host networking.
    pub async fn shutdown(self) -> ShutdownReport {
        self.coordinator.run().await
    }
}

/// Create the directories the service needs.
pub async fn install(config: &ServiceConfig) -> Result<(), ServiceError> {
    tokio::fs::create_dir_all(&config.runtime_dir).await?;
    tokio::fs::create_dir_all(config.profiles_runtime_dir()).await?;
    if let Some(dir) = &config.watch.profiles_dir {
        tokio::fs::create_dir_all(dir).await?;
    }
    info!("Runtime directories created under {}", config.runtime_dir.display());
    Ok(())
}

/// Reset host networking and remove runtime files left by the service.
pub async fn uninstall(config: &ServiceConfig, platform: Arc<dyn Platform>) -> Result<(), ServiceError> {
    let cleaner = NetworkCleaner::new(platform, config.cleaner_config());
    let reset = cleaner.global_reset().await;
    if let Err(e) = cleaner.final_cleanup().await {
        warn!("Platform cleanup incomplete: {}", e);
    }
    remove_if_present(&config.control.socket_path).await?;
    RunMarker::new(config.marker_path()).release().await?;
    // Files are gone either way; a failed reset still fails the command
    reset?;
    info!("Service state removed");
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), ServiceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::marker::MarkerState;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tund_net::testing::{FakePlatform, Journal};
    use tund_net::NetworkOverride;
    use tund_profile::testing::{Script, ScriptedLauncher};
    use tund_profile::{ProfileId, ProfileState, RegistryPhase};

    fn test_config(name: &str) -> ServiceConfig {
        let root: PathBuf =
            std::env::temp_dir().join(format!("tund-daemon-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&root);
        let mut config = ServiceConfig::default();
        config.runtime_dir = root.join("run");
        config.control.transport = Transport::Tcp;
        config.control.tcp_addr = "127.0.0.1:0".parse().unwrap();
        config.control.socket_path = root.join("tund.sock");
        config.watch.profiles_dir = Some(root.join("profiles.d"));
        config.watch.interval_ms = 20;
        config.shutdown.settle_ms = 10;
        config.shutdown.final_settle_ms = 10;
        config.tunnel.stop_grace_ms = 200;
        config
    }

    fn fakes() -> (FakePlatform, ScriptedLauncher, Journal) {
        let journal = Journal::new();
        let host = FakePlatform::with_journal(journal.clone());
        let launcher =
            ScriptedLauncher::new(journal.clone(), Script::connects("tun0")).with_host(host.clone());
        (host, launcher, journal)
    }

    async fn http_get(endpoint: &Endpoint, path: &str) -> String {
        let Endpoint::Tcp(addr) = endpoint else {
            panic!("expected tcp endpoint");
        };
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: tund\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_start_serve_shutdown() {
        let config = test_config("lifecycle");
        let profiles_dir = config.watch.profiles_dir.clone().unwrap();
        install(&config).await.unwrap();
        std::fs::write(
            profiles_dir.join("office.toml"),
            "id = \"office\"\nserver = \"office.example.com\"\nautostart = true\n",
        )
        .unwrap();

        let (host, launcher, _journal) = fakes();
        let daemon = Daemon::start(config.clone(), Arc::new(host.clone()), Arc::new(launcher), false)
            .await
            .unwrap();
        assert_eq!(daemon.startup_report().previous, MarkerState::Absent);
        assert_eq!(daemon.registry().phase(), RegistryPhase::Accepting);
        assert!(config.marker_path().exists());

        let response = http_get(daemon.endpoint(), "/status").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"running\""));

        let id = ProfileId::new("office").unwrap();
        for _ in 0..500 {
            if daemon.registry().get(&id).map(|r| r.state) == Some(ProfileState::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(daemon.registry().get(&id).unwrap().state, ProfileState::Connected);

        let registry = daemon.registry().clone();
        let endpoint = daemon.endpoint().clone();
        let report = daemon.shutdown().await;
        assert!(report.drained);
        assert!(registry.is_empty());
        assert_eq!(registry.cleaner().global_reset_count(), 1);
        assert!(host.host().is_clean());
        assert!(!config.marker_path().exists());
        let Endpoint::Tcp(addr) = endpoint else { unreachable!() };
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_unclean_restart_resets_first() {
        let config = test_config("unclean");
        std::fs::create_dir_all(&config.runtime_dir).unwrap();
        std::fs::write(config.marker_path(), "999999999").unwrap();

        let (host, launcher, journal) = fakes();
        let mut leftover = NetworkOverride::new();
        leftover.set_interface("tun9");
        host.apply(&leftover);

        let daemon = Daemon::start(config, Arc::new(host.clone()), Arc::new(launcher), false)
            .await
            .unwrap();
        assert!(daemon.startup_report().reset);
        assert!(!host.host().interfaces.contains("tun9"));
        assert_eq!(journal.count("platform:reset_dns"), 1);
        daemon.shutdown().await;
        assert_eq!(journal.count("platform:reset_dns"), 2);
    }

    #[tokio::test]
    async fn test_bind_failure_releases_marker() {
        let config = test_config("second");
        std::fs::create_dir_all(&config.runtime_dir).unwrap();

        let (host, launcher, _journal) = fakes();
        let first = Daemon::start(config.clone(), Arc::new(host.clone()), Arc::new(launcher.clone()), false)
            .await
            .unwrap();

        // Port already taken by the first instance
        let mut second = config.clone();
        second.control.tcp_addr = match first.endpoint() {
            Endpoint::Tcp(addr) => *addr,
            Endpoint::Unix(_) => unreachable!(),
        };
        second.runtime_dir = config.runtime_dir.join("other");
        let err = Daemon::start(second.clone(), Arc::new(host.clone()), Arc::new(launcher), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Bind { .. }));
        assert!(!second.marker_path().exists());

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_uninstall() {
        let config = test_config("uninstall");
        install(&config).await.unwrap();
        std::fs::write(config.marker_path(), "1234").unwrap();
        std::fs::write(&config.control.socket_path, "").unwrap();

        let host = FakePlatform::new();
        let mut leftover = NetworkOverride::new();
        leftover.set_interface("tap0");
        host.apply(&leftover);

        uninstall(&config, Arc::new(host.clone())).await.unwrap();
        assert!(host.host().is_clean());
        assert_eq!(host.calls("final_cleanup"), 1);
        assert!(!config.marker_path().exists());
        assert!(!config.control.socket_path.exists());
        uninstall(&config, Arc::new(host)).await.unwrap();
    }

    #[tokio::test]
    async fn test_uninstall_reports_failed_reset() {
        let config = test_config("uninstall-fail");
        install(&config).await.unwrap();
        std::fs::write(config.marker_path(), "1234").unwrap();

        let host = FakePlatform::new();
        host.fail_on("flush_routes");
        let err = uninstall(&config, Arc::new(host.clone())).await.unwrap_err();
        assert!(matches!(err, ServiceError::Platform(_)));
        assert_eq!(host.calls("clear_dns_cache"), 1);
        assert_eq!(host.calls("final_cleanup"), 1);
        assert!(!config.marker_path().exists());
    }
}
