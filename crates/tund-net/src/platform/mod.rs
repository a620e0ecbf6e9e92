//! OS capability layer.
//!
//! Every OS-specific networking call goes through [`Platform`]; one
//! implementation is chosen at startup by [`native`]. Nothing outside
//! this module branches on the target OS.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxPlatform;
pub use macos::MacosPlatform;
pub use windows::WindowsPlatform;

use crate::error::PlatformError;
use crate::overrides::{NetworkOverride, Route};
use async_trait::async_trait;
use std::sync::Arc;

/// Host networking primitives.
///
/// Every method must be safe to call when there is nothing to undo.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Restore DNS servers on the given tunnel interfaces (and any
    /// global override the OS keeps) to their defaults.
    async fn reset_dns(&self, interfaces: &[String]) -> Result<(), PlatformError>;

    /// Drop search domains and other resolver settings pushed by tunnels.
    async fn clear_dns(&self, interfaces: &[String]) -> Result<(), PlatformError>;

    /// Flush the resolver cache.
    async fn clear_dns_cache(&self) -> Result<(), PlatformError>;

    /// Flush ephemeral routing state.
    async fn flush_routes(&self) -> Result<(), PlatformError>;

    /// Delete a virtual interface.
    async fn remove_interface(&self, name: &str) -> Result<(), PlatformError>;

    /// Delete one route.
    async fn remove_route(&self, route: &Route) -> Result<(), PlatformError>;

    /// Undo the DNS part of one profile's override.
    async fn revert_dns(&self, record: &NetworkOverride) -> Result<(), PlatformError>;

    /// Names of all network interfaces present on the host.
    async fn list_interfaces(&self) -> Result<Vec<String>, PlatformError> {
        system_interfaces().await
    }

    /// Platform residue removed once, at the very end of shutdown.
    async fn final_cleanup(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Select the implementation for the running OS.
pub fn native() -> Arc<dyn Platform> {
    if cfg!(target_os = "macos") {
        Arc::new(MacosPlatform::new())
    } else if cfg!(target_os = "windows") {
        Arc::new(WindowsPlatform::new())
    } else {
        Arc::new(LinuxPlatform::new())
    }
}

/// Enumerate interfaces with sysinfo.
pub(crate) async fn system_interfaces() -> Result<Vec<String>, PlatformError> {
    tokio::task::spawn_blocking(|| {
        let networks = sysinfo::Networks::new_with_refreshed_list();
        let mut names: Vec<String> = networks.list().keys().cloned().collect();
        names.sort();
        names
    })
    .await
    .map_err(|e| PlatformError::Query(e.to_string()))
}

/// Dotted IPv4 netmask for a prefix length.
pub(crate) fn ipv4_netmask(prefix: u8) -> String {
    let bits: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    std::net::Ipv4Addr::from(bits).to_string()
}
