//! Windows: netsh, ipconfig, route.

use super::{ipv4_netmask, Platform};
use crate::error::PlatformError;
use crate::exec;
use crate::overrides::{NetworkOverride, Route};
use async_trait::async_trait;

const NO_ELEMENT: &[&str] = &["Element not found", "The filename, directory name", "not found"];

/// netsh backend.
#[derive(Debug, Default, Clone)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }

    async fn dhcp_dns(&self, iface: &str) -> Result<(), PlatformError> {
        let name = format!("name={}", iface);
        exec::run_absent_ok(
            "netsh",
            &["interface", "ipv4", "set", "dnsservers", &name, "source=dhcp"],
            NO_ELEMENT,
        )
        .await
    }
}

#[async_trait]
impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn reset_dns(&self, interfaces: &[String]) -> Result<(), PlatformError> {
        let mut first = None;
        for iface in interfaces {
            if let Err(e) = self.dhcp_dns(iface).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn clear_dns(&self, interfaces: &[String]) -> Result<(), PlatformError> {
        let mut first = None;
        for iface in interfaces {
            let name = format!("name={}", iface);
            if let Err(e) = exec::run_absent_ok(
                "netsh",
                &["interface", "ipv4", "delete", "dnsservers", &name, "all"],
                NO_ELEMENT,
            )
            .await
            {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn clear_dns_cache(&self) -> Result<(), PlatformError> {
        exec::run("ipconfig", &["/flushdns"]).await.map(|_| ())
    }

    async fn flush_routes(&self) -> Result<(), PlatformError> {
        exec::run("netsh", &["interface", "ipv4", "delete", "destinationcache"])
            .await
            .map(|_| ())
    }

    async fn remove_interface(&self, name: &str) -> Result<(), PlatformError> {
        // TAP adapters are persistent; cycling them drops addresses and routes.
        let name = format!("name={}", name);
        exec::run_absent_ok(
            "netsh",
            &["interface", "set", "interface", &name, "admin=disabled"],
            NO_ELEMENT,
        )
        .await?;
        exec::run_absent_ok(
            "netsh",
            &["interface", "set", "interface", &name, "admin=enabled"],
            NO_ELEMENT,
        )
        .await
    }

    async fn remove_route(&self, route: &Route) -> Result<(), PlatformError> {
        if route.is_ipv6() {
            let cidr = route.to_string();
            return exec::run_absent_ok("route", &["delete", &cidr], NO_ELEMENT).await;
        }
        let addr = route.addr.to_string();
        let mask = ipv4_netmask(route.prefix);
        exec::run_absent_ok("route", &["delete", &addr, "mask", &mask], NO_ELEMENT).await
    }

    async fn revert_dns(&self, record: &NetworkOverride) -> Result<(), PlatformError> {
        match record.interface.as_deref() {
            Some(iface) => self.dhcp_dns(iface).await,
            None => Ok(()),
        }
    }
}
