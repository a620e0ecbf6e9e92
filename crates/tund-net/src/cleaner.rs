//! Network cleaner
//!
//! Sequences [`Platform`] calls into the reset operations used by
//! startup reconciliation, the control API, profile teardown and
//! shutdown. Every step is attempted even when an earlier one fails;
//! the first error is returned after the sequence completes.

use crate::error::PlatformError;
use crate::overrides::NetworkOverride;
use crate::platform::Platform;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cleaner configuration.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Interface name prefixes treated as tunnel leftovers
    pub interface_prefixes: Vec<String>,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interface_prefixes: vec!["tun".to_string(), "tap".to_string(), "utun".to_string()],
        }
    }
}

/// Idempotent host networking cleanup.
///
/// Cheap to clone; all clones share the platform backend and counters.
#[derive(Clone)]
pub struct NetworkCleaner {
    platform: Arc<dyn Platform>,
    config: Arc<CleanerConfig>,
    global_resets: Arc<AtomicUsize>,
}

impl NetworkCleaner {
    pub fn new(platform: Arc<dyn Platform>, config: CleanerConfig) -> Self {
        Self {
            platform,
            config: Arc::new(config),
            global_resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Name of the platform backend.
    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }

    /// Number of completed [`global_reset`](Self::global_reset) runs.
    pub fn global_reset_count(&self) -> usize {
        self.global_resets.load(Ordering::SeqCst)
    }

    /// Tunnel interfaces currently present on the host.
    pub async fn stray_interfaces(&self) -> Result<Vec<String>, PlatformError> {
        let all = self.platform.list_interfaces().await?;
        Ok(all
            .into_iter()
            .filter(|name| self.is_tunnel_interface(name))
            .collect())
    }

    fn is_tunnel_interface(&self, name: &str) -> bool {
        self.config
            .interface_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Interfaces to address, or none when the query fails.
    async fn targets(&self) -> Vec<String> {
        match self.stray_interfaces().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Interface query failed, continuing without: {}", e);
                Vec::new()
            }
        }
    }

    /// Restore DNS servers to their defaults.
    pub async fn reset_dns(&self) -> Result<(), PlatformError> {
        let targets = self.targets().await;
        logged("reset_dns", self.platform.reset_dns(&targets).await)
    }

    /// Remove search domains and other pushed resolver settings.
    pub async fn clear_dns(&self) -> Result<(), PlatformError> {
        let targets = self.targets().await;
        logged("clear_dns", self.platform.clear_dns(&targets).await)
    }

    /// Flush the resolver cache.
    pub async fn clear_dns_cache(&self) -> Result<(), PlatformError> {
        logged("clear_dns_cache", self.platform.clear_dns_cache().await)
    }

    /// Remove leftover tunnel interfaces and flush ephemeral routes.
    pub async fn reset_networking(&self) -> Result<(), PlatformError> {
        let mut first = None;
        for iface in self.targets().await {
            info!("Removing leftover interface {}", iface);
            if let Err(e) = logged("remove_interface", self.platform.remove_interface(&iface).await) {
                first.get_or_insert(e);
            }
        }
        if let Err(e) = logged("flush_routes", self.platform.flush_routes().await) {
            first.get_or_insert(e);
        }
        first.map_or(Ok(()), Err)
    }

    /// Undo exactly what one profile recorded.
    ///
    /// Routes go first (in reverse order of installation), then DNS,
    /// then the interface. A partially filled record is fine.
    pub async fn rollback_override(&self, record: &NetworkOverride) -> Result<(), PlatformError> {
        if record.is_empty() {
            return Ok(());
        }
        debug!(
            "Rolling back override: iface={:?} dns={} routes={}",
            record.interface,
            record.dns_servers.len(),
            record.routes.len()
        );

        let mut first = None;
        for route in record.routes.iter().rev() {
            if let Err(e) = logged("remove_route", self.platform.remove_route(route).await) {
                first.get_or_insert(e);
            }
        }
        if record.touches_dns() {
            if let Err(e) = logged("revert_dns", self.platform.revert_dns(record).await) {
                first.get_or_insert(e);
            }
        }
        if let Some(iface) = record.interface.as_deref() {
            if let Err(e) = logged("remove_interface", self.platform.remove_interface(iface).await) {
                first.get_or_insert(e);
            }
        }
        if record.touches_dns() {
            if let Err(e) = self.clear_dns_cache().await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Reset DNS, clear DNS, reset networking and flush the DNS cache,
    /// in that order.
    ///
    /// Used when per-profile records are missing or untrusted. Tears
    /// down every active tunnel's host state.
    pub async fn global_reset(&self) -> Result<(), PlatformError> {
        info!("Global network reset ({})", self.platform.name());
        let mut first = None;
        for result in [
            self.reset_dns().await,
            self.clear_dns().await,
            self.reset_networking().await,
            self.clear_dns_cache().await,
        ] {
            if let Err(e) = result {
                first.get_or_insert(e);
            }
        }
        self.global_resets.fetch_add(1, Ordering::SeqCst);
        first.map_or(Ok(()), Err)
    }

    /// Platform residue removed at the end of shutdown.
    pub async fn final_cleanup(&self) -> Result<(), PlatformError> {
        logged("final_cleanup", self.platform.final_cleanup().await)
    }
}

fn logged(step: &str, result: Result<(), PlatformError>) -> Result<(), PlatformError> {
    if let Err(e) = &result {
        warn!("Network cleanup step {} failed: {}", step, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::Route;
    use crate::testing::FakePlatform;

    fn cleaner(fake: &FakePlatform) -> NetworkCleaner {
        NetworkCleaner::new(Arc::new(fake.clone()), CleanerConfig::default())
    }

    fn tunnel_override(iface: &str) -> NetworkOverride {
        let mut record = NetworkOverride::new();
        record.set_interface(iface);
        record.add_dns_server("10.8.0.1".parse().unwrap());
        record.add_search_domain("corp.example");
        record.add_route(Route::parse_cidr("10.8.0.0/24", None).unwrap());
        record
    }

    #[tokio::test]
    async fn test_stray_interfaces_filtered_by_prefix() {
        let fake = FakePlatform::new();
        fake.apply(&tunnel_override("tun0"));
        fake.apply(&tunnel_override("tap1"));

        let mut found = cleaner(&fake).stray_interfaces().await.unwrap();
        found.sort();
        assert_eq!(found, vec!["tap1", "tun0"]);
    }

    #[tokio::test]
    async fn test_global_operations_idempotent() {
        let fake = FakePlatform::new();
        fake.apply(&tunnel_override("tun0"));
        fake.apply(&tunnel_override("tun1"));
        let cleaner = cleaner(&fake);

        cleaner.reset_dns().await.unwrap();
        let once = fake.host();
        cleaner.reset_dns().await.unwrap();
        assert_eq!(fake.host(), once);

        cleaner.clear_dns().await.unwrap();
        let once = fake.host();
        cleaner.clear_dns().await.unwrap();
        assert_eq!(fake.host(), once);

        cleaner.clear_dns_cache().await.unwrap();
        let once = fake.host();
        cleaner.clear_dns_cache().await.unwrap();
        assert_eq!(fake.host(), once);

        cleaner.reset_networking().await.unwrap();
        let once = fake.host();
        cleaner.reset_networking().await.unwrap();
        assert_eq!(fake.host(), once);

        assert!(once.is_clean());
    }

    #[tokio::test]
    async fn test_global_reset_order_and_count() {
        let fake = FakePlatform::new();
        fake.apply(&tunnel_override("tun0"));
        let cleaner = cleaner(&fake);

        cleaner.global_reset().await.unwrap();
        assert_eq!(cleaner.global_reset_count(), 1);
        assert!(fake.host().is_clean());

        let ops = fake.journal().entries();
        let pos = |name: &str| ops.iter().position(|e| e == name).unwrap();
        assert!(pos("platform:reset_dns") < pos("platform:clear_dns"));
        assert!(pos("platform:clear_dns") < pos("platform:flush_routes"));
        assert!(pos("platform:flush_routes") < pos("platform:clear_dns_cache"));
    }

    #[tokio::test]
    async fn test_global_reset_continues_after_failure() {
        let fake = FakePlatform::new();
        fake.apply(&tunnel_override("tun0"));
        fake.fail_on("reset_dns");
        let cleaner = cleaner(&fake);

        let result = cleaner.global_reset().await;
        assert!(result.is_err());
        assert_eq!(fake.calls("flush_routes"), 1);
        assert_eq!(fake.calls("clear_dns_cache"), 1);
        assert!(fake.host().interfaces.iter().all(|i| !i.starts_with("tun")));
        assert_eq!(cleaner.global_reset_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_is_precise() {
        let fake = FakePlatform::new();
        let a = tunnel_override("tun0");
        let mut b = NetworkOverride::new();
        b.set_interface("tun1");
        b.add_dns_server("10.9.0.1".parse().unwrap());
        b.add_route(Route::parse_cidr("10.9.0.0/24", None).unwrap());
        fake.apply(&a);
        fake.apply(&b);

        cleaner(&fake).rollback_override(&a).await.unwrap();

        let host = fake.host();
        assert!(!host.interfaces.contains("tun0"));
        assert!(host.interfaces.contains("tun1"));
        assert!(host.routes.contains(&b.routes[0]));
        assert!(!host.routes.contains(&a.routes[0]));
        assert_eq!(host.dns.get("tun1"), Some(&b.dns_servers));
    }

    #[tokio::test]
    async fn test_rollback_partial_and_empty() {
        let fake = FakePlatform::new();
        let cleaner = cleaner(&fake);

        cleaner.rollback_override(&NetworkOverride::new()).await.unwrap();
        assert_eq!(fake.journal().len(), 0);

        // Only a route was observed before the process died
        let mut partial = NetworkOverride::new();
        partial.add_route(Route::parse_cidr("10.8.0.0/24", None).unwrap());
        fake.apply(&partial);
        cleaner.rollback_override(&partial).await.unwrap();
        assert!(fake.host().routes.is_empty());
    }
}
