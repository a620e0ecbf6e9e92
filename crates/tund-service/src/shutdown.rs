//! Shutdown sequence
//!
//! Ordered and best-effort: stop accepting work, drain profiles within a
//! grace period, then reset host networking exactly once no matter how
//! the drain went.

use crate::config::ShutdownConfig;
use crate::marker::RunMarker;
use crate::server::ServerHandle;
use crate::watch::WatcherHandle;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{error, info, warn};
use tund_profile::ProfileRegistry;

type StopHook = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every profile disconnected within the drain grace
    pub drained: bool,
    /// Profiles still registered when cleanup ran
    pub remaining: usize,
    /// The drain phase panicked
    pub panicked: bool,
}

/// Runs the shutdown sequence once.
pub struct ShutdownCoordinator {
    registry: ProfileRegistry,
    marker: RunMarker,
    config: ShutdownConfig,
    server: Option<ServerHandle>,
    hooks: Vec<StopHook>,
}

impl ShutdownCoordinator {
    pub fn new(registry: ProfileRegistry, marker: RunMarker, config: ShutdownConfig) -> Self {
        Self {
            registry,
            marker,
            config,
            server: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_server(mut self, server: ServerHandle) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_watcher(self, watcher: WatcherHandle) -> Self {
        self.on_stop(watcher.stop())
    }

    /// Run `hook` right after the control server stops.
    pub fn on_stop(mut self, hook: impl Future<Output = ()> + Send + 'static) -> Self {
        self.hooks.push(Box::pin(hook));
        self
    }

    pub async fn run(self) -> ShutdownReport {
        let ShutdownCoordinator {
            registry,
            marker,
            config,
            server,
            hooks,
        } = self;
        info!("Shutting down");

        let drain = {
            let registry = registry.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Some(server) = server {
                    server.shutdown(config.server_deadline()).await;
                }
                for hook in hooks {
                    hook.await;
                }
                tokio::time::sleep(config.settle()).await;

                registry.close();
                let stopping = registry.stop_all(registry.config().stop_grace);
                info!("Stopping {} profile(s)", stopping);
                match tokio::time::timeout(config.drain_grace(), registry.wait_idle()).await {
                    Ok(()) => true,
                    Err(_) => {
                        warn!(
                            "{} profile(s) still running after {:?}, killing",
                            registry.len(),
                            config.drain_grace()
                        );
                        registry.stop_all(Duration::ZERO);
                        if tokio::time::timeout(config.kill_wait(), registry.wait_idle())
                            .await
                            .is_err()
                        {
                            error!("{} profile(s) did not exit after kill", registry.len());
                        }
                        false
                    }
                }
            })
        };

        let (drained, panicked) = match drain.await {
            Ok(drained) => (drained, false),
            Err(e) => {
                error!("Shutdown drain failed: {}", e);
                registry.close();
                registry.stop_all(Duration::ZERO);
                (false, true)
            }
        };

        let cleaner = registry.cleaner();
        if let Err(e) = cleaner.global_reset().await {
            warn!("Final network reset incomplete: {}", e);
        }
        if let Err(e) = cleaner.final_cleanup().await {
            warn!("Final platform cleanup incomplete: {}", e);
        }
        tokio::time::sleep(config.final_settle()).await;

        if let Err(e) = marker.release().await {
            warn!("{}", e);
        }

        let report = ShutdownReport {
            drained,
            remaining: registry.len(),
            panicked,
        };
        info!(
            "Shutdown complete (drained: {}, remaining: {})",
            report.drained, report.remaining
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tund_net::testing::{FakePlatform, Journal};
    use tund_net::{CleanerConfig, NetworkCleaner};
    use tund_profile::testing::{Script, ScriptedLauncher};
    use tund_profile::{Profile, ProfileId, ProfileState, RegistryConfig, RegistryPhase};

    struct Harness {
        registry: ProfileRegistry,
        launcher: ScriptedLauncher,
        host: FakePlatform,
        journal: Journal,
        marker: RunMarker,
    }

    fn harness(name: &str, script: Script, stop_grace: Duration) -> Harness {
        let journal = Journal::new();
        let host = FakePlatform::with_journal(journal.clone());
        let launcher = ScriptedLauncher::new(journal.clone(), script).with_host(host.clone());
        let cleaner = NetworkCleaner::new(Arc::new(host.clone()), CleanerConfig::default());
        let config = RegistryConfig {
            stop_grace,
            ..RegistryConfig::default()
        };
        let registry = ProfileRegistry::new(Arc::new(launcher.clone()), cleaner, config);
        registry.open();

        let path: PathBuf =
            std::env::temp_dir().join(format!("tund-shutdown-{}-{}.pid", std::process::id(), name));
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        Harness {
            registry,
            launcher,
            host,
            journal,
            marker: RunMarker::new(path),
        }
    }

    fn fast() -> ShutdownConfig {
        ShutdownConfig {
            server_deadline_ms: 100,
            settle_ms: 10,
            drain_grace_ms: 2_000,
            kill_wait_ms: 1_000,
            final_settle_ms: 10,
        }
    }

    async fn start(h: &Harness, ids: &[&str]) {
        for id in ids {
            let id = ProfileId::new(*id).unwrap();
            h.registry.add(Profile::new(id.clone(), "vpn.example.com")).unwrap();
            for _ in 0..500 {
                if h.registry.get(&id).map(|r| r.state) == Some(ProfileState::Connected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_drains_then_resets_once() {
        let h = harness("drain", Script::connects("tun0"), Duration::from_millis(500));
        h.launcher.push(&ProfileId::new("b").unwrap(), Script::connects("tun1"));
        h.launcher.push(&ProfileId::new("c").unwrap(), Script::connects("tun2"));
        start(&h, &["a", "b", "c"]).await;

        let report = ShutdownCoordinator::new(h.registry.clone(), h.marker.clone(), fast())
            .run()
            .await;
        assert_eq!(
            report,
            ShutdownReport {
                drained: true,
                remaining: 0,
                panicked: false
            }
        );
        assert_eq!(h.registry.phase(), RegistryPhase::ShuttingDown);
        assert_eq!(h.registry.cleaner().global_reset_count(), 1);
        assert_eq!(h.host.calls("final_cleanup"), 1);
        assert!(h.host.host().is_clean());
        assert!(!h.marker.path().exists());

        // Every tunnel was down before the global reset
        let reset = h.journal.position("platform:reset_dns").unwrap();
        for id in ["a", "b", "c"] {
            assert!(h.journal.position(&format!("process:exit:{}", id)).unwrap() < reset);
        }
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let h = harness("empty", Script::connects("tun0"), Duration::from_millis(500));
        let report = ShutdownCoordinator::new(h.registry.clone(), h.marker.clone(), fast())
            .run()
            .await;
        assert!(report.drained);
        assert_eq!(h.registry.cleaner().global_reset_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_timeout_still_resets() {
        let h = harness(
            "timeout",
            Script::connects("tun0").ignoring_term(),
            Duration::from_secs(30),
        );
        start(&h, &["a", "b"]).await;

        let config = ShutdownConfig {
            drain_grace_ms: 100,
            ..fast()
        };
        let report = ShutdownCoordinator::new(h.registry.clone(), h.marker.clone(), config)
            .run()
            .await;
        assert!(!report.drained);
        assert_eq!(report.remaining, 0);
        assert!(!report.panicked);
        for id in ["a", "b"] {
            let id = ProfileId::new(id).unwrap();
            assert_eq!(h.launcher.live(&id), 0);
            assert_eq!(h.journal.count(&format!("process:kill:{}", id)), 1);
        }
        assert_eq!(h.registry.cleaner().global_reset_count(), 1);
        assert!(!h.marker.path().exists());
    }

    #[tokio::test]
    async fn test_cleanup_failures_do_not_stop_sequence() {
        let h = harness("failing", Script::connects("tun0"), Duration::from_millis(500));
        start(&h, &["a"]).await;
        h.host.fail_on("reset_dns");
        h.host.fail_on("final_cleanup");

        let report = ShutdownCoordinator::new(h.registry.clone(), h.marker.clone(), fast())
            .run()
            .await;
        assert!(report.drained);
        assert_eq!(h.registry.cleaner().global_reset_count(), 1);
        assert_eq!(h.host.calls("clear_dns_cache"), 2);
        assert!(!h.marker.path().exists());
    }

    #[tokio::test]
    async fn test_panic_in_drain_still_resets() {
        let h = harness("panic", Script::connects("tun0"), Duration::from_millis(500));
        start(&h, &["a"]).await;

        let report = ShutdownCoordinator::new(h.registry.clone(), h.marker.clone(), fast())
            .on_stop(async { panic!("watcher blew up"); })
            .run()
            .await;
        assert!(report.panicked);
        assert!(!report.drained);
        assert_eq!(h.registry.phase(), RegistryPhase::ShuttingDown);
        assert_eq!(h.registry.cleaner().global_reset_count(), 1);
        assert!(!h.marker.path().exists());

        // The emergency stop still takes the tunnel down
        tokio::time::timeout(Duration::from_secs(2), h.registry.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_server_and_hooks_first() {
        let h = harness("hooks", Script::connects("tun0"), Duration::from_millis(500));
        let journal = h.journal.clone();
        let server = crate::server::serve(
            &crate::server::Endpoint::Tcp("127.0.0.1:0".parse().unwrap()),
            axum::Router::new(),
        )
        .await
        .unwrap();
        let crate::server::Endpoint::Tcp(addr) = server.endpoint().clone() else {
            panic!("expected tcp endpoint");
        };

        ShutdownCoordinator::new(h.registry.clone(), h.marker.clone(), fast())
            .with_server(server)
            .on_stop(async move { journal.record("hook") })
            .run()
            .await;
        assert!(h.journal.position("hook").unwrap() < h.journal.position("platform:reset_dns").unwrap());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
