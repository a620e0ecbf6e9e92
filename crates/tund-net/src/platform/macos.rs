//! macOS: networksetup, route, scutil.

use super::Platform;
use crate::error::PlatformError;
use crate::exec;
use crate::overrides::{NetworkOverride, Route};
use async_trait::async_trait;
use tracing::debug;

const NO_DEVICE: &[&str] = &["does not exist", "no such interface"];
const NO_ROUTE: &[&str] = &["not in table"];

/// Prefix of the dynamic store keys this service writes.
const SCUTIL_KEY_PREFIX: &str = "State:/Network/Service/tund";

/// networksetup + scutil backend.
#[derive(Debug, Default, Clone)]
pub struct MacosPlatform;

impl MacosPlatform {
    pub fn new() -> Self {
        Self
    }

    /// User-visible network services, e.g. "Wi-Fi".
    async fn services(&self) -> Result<Vec<String>, PlatformError> {
        let out = exec::run("networksetup", &["-listallnetworkservices"]).await?;
        Ok(parse_services(&out))
    }

    async fn for_each_service(&self, flag: &str) -> Result<(), PlatformError> {
        let mut first = None;
        for service in self.services().await? {
            if let Err(e) = exec::run("networksetup", &[flag, &service, "Empty"]).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn remove_key(&self, key: &str) -> Result<(), PlatformError> {
        exec::run_with_input("scutil", &[], &format!("remove {}\n", key))
            .await
            .map(|_| ())
    }
}

/// Skip the header line and strip the disabled marker.
pub(crate) fn parse_services(out: &str) -> Vec<String> {
    out.lines()
        .skip(1)
        .map(|line| line.trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keys from `scutil` "list" output, e.g. `subKey [0] = State:/...`.
pub(crate) fn parse_scutil_keys(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_once(" = "))
        .map(|(_, key)| key.trim().to_string())
        .filter(|key| key.starts_with(SCUTIL_KEY_PREFIX))
        .collect()
}

#[async_trait]
impl Platform for MacosPlatform {
    fn name(&self) -> &'static str {
        "macos"
    }

    async fn reset_dns(&self, _interfaces: &[String]) -> Result<(), PlatformError> {
        self.for_each_service("-setdnsservers").await
    }

    async fn clear_dns(&self, _interfaces: &[String]) -> Result<(), PlatformError> {
        self.for_each_service("-setsearchdomains").await
    }

    async fn clear_dns_cache(&self) -> Result<(), PlatformError> {
        exec::run("dscacheutil", &["-flushcache"]).await?;
        exec::run("killall", &["-HUP", "mDNSResponder"]).await.map(|_| ())
    }

    async fn flush_routes(&self) -> Result<(), PlatformError> {
        // Routes through a utun device are dropped by the kernel with the device.
        debug!("macos: no route cache to flush");
        Ok(())
    }

    async fn remove_interface(&self, name: &str) -> Result<(), PlatformError> {
        exec::run_absent_ok("ifconfig", &[name, "destroy"], NO_DEVICE).await
    }

    async fn remove_route(&self, route: &Route) -> Result<(), PlatformError> {
        let cidr = route.to_string();
        let via = route.via.map(|gw| gw.to_string());
        let mut args = vec!["-n", "delete"];
        if route.is_ipv6() {
            args.push("-inet6");
        }
        args.extend(["-net", cidr.as_str()]);
        if let Some(via) = via.as_deref() {
            args.push(via);
        }
        exec::run_absent_ok("route", &args, NO_ROUTE).await
    }

    async fn revert_dns(&self, record: &NetworkOverride) -> Result<(), PlatformError> {
        match record.interface.as_deref() {
            Some(iface) => {
                self.remove_key(&format!("{}-{}/DNS", SCUTIL_KEY_PREFIX, iface))
                    .await
            }
            None if record.touches_dns() => self.reset_dns(&[]).await,
            None => Ok(()),
        }
    }

    async fn final_cleanup(&self) -> Result<(), PlatformError> {
        let out = exec::run_with_input(
            "scutil",
            &[],
            &format!("list {}.*\n", SCUTIL_KEY_PREFIX),
        )
        .await?;
        let mut first = None;
        for key in parse_scutil_keys(&out) {
            if let Err(e) = self.remove_key(&key).await {
                first.get_or_insert(e);
            }
        }
        if let Err(e) = self.reset_dns(&[]).await {
            first.get_or_insert(e);
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_services() {
        let out = "An asterisk (*) denotes that a network service is disabled.\nWi-Fi\n*Thunderbolt Bridge\n\nUSB 10/100/1000 LAN\n";
        assert_eq!(
            parse_services(out),
            vec!["Wi-Fi", "Thunderbolt Bridge", "USB 10/100/1000 LAN"]
        );
    }

    #[test]
    fn test_parse_scutil_keys() {
        let out = "  subKey [0] = State:/Network/Service/tund-utun4/DNS\n  subKey [1] = State:/Network/Service/ABCD/DNS\n";
        assert_eq!(
            parse_scutil_keys(out),
            vec!["State:/Network/Service/tund-utun4/DNS"]
        );
    }
}
