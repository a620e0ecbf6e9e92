//! Linux: iproute2 and systemd-resolved.

use super::Platform;
use crate::error::PlatformError;
use crate::exec;
use crate::overrides::{NetworkOverride, Route};
use async_trait::async_trait;

const NO_DEVICE: &[&str] = &["Cannot find device", "does not exist", "Failed to resolve interface"];
const NO_ROUTE: &[&str] = &["No such process", "No such device"];

/// iproute2 + resolvectl backend.
#[derive(Debug, Default, Clone)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    async fn reset_dns(&self, interfaces: &[String]) -> Result<(), PlatformError> {
        let mut first = None;
        for iface in interfaces {
            if let Err(e) = exec::run_absent_ok("resolvectl", &["revert", iface], NO_DEVICE).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn clear_dns(&self, interfaces: &[String]) -> Result<(), PlatformError> {
        let mut first = None;
        for iface in interfaces {
            if let Err(e) =
                exec::run_absent_ok("resolvectl", &["domain", iface, ""], NO_DEVICE).await
            {
                first.get_or_insert(e);
            }
        }
        if let Err(e) = exec::run("resolvectl", &["reset-server-features"]).await {
            first.get_or_insert(e);
        }
        first.map_or(Ok(()), Err)
    }

    async fn clear_dns_cache(&self) -> Result<(), PlatformError> {
        exec::run("resolvectl", &["flush-caches"]).await.map(|_| ())
    }

    async fn flush_routes(&self) -> Result<(), PlatformError> {
        exec::run("ip", &["route", "flush", "cache"]).await?;
        exec::run("ip", &["-6", "route", "flush", "cache"]).await.map(|_| ())
    }

    async fn remove_interface(&self, name: &str) -> Result<(), PlatformError> {
        exec::run_absent_ok("ip", &["link", "delete", name], NO_DEVICE).await
    }

    async fn remove_route(&self, route: &Route) -> Result<(), PlatformError> {
        let cidr = route.to_string();
        let via = route.via.map(|gw| gw.to_string());
        let mut args = Vec::with_capacity(6);
        if route.is_ipv6() {
            args.push("-6");
        }
        args.extend(["route", "del", cidr.as_str()]);
        if let Some(via) = via.as_deref() {
            args.extend(["via", via]);
        }
        exec::run_absent_ok("ip", &args, NO_ROUTE).await
    }

    async fn revert_dns(&self, record: &NetworkOverride) -> Result<(), PlatformError> {
        match record.interface.as_deref() {
            Some(iface) => exec::run_absent_ok("resolvectl", &["revert", iface], NO_DEVICE).await,
            // Per-link settings vanish with the link; nothing to address without one.
            None => Ok(()),
        }
    }
}
