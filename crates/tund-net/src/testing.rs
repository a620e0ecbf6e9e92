//! Test doubles.
//!
//! [`FakePlatform`] keeps a simulated host (interfaces, per-interface
//! DNS, routes, resolver cache) and records every call in a shared
//! [`Journal`], so tests in this and downstream crates can assert both
//! on resulting host state and on the order of operations.

use crate::error::PlatformError;
use crate::overrides::{NetworkOverride, Route};
use crate::platform::Platform;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Append-only, shared log of events from fakes across crates.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position_prefix(&self, prefix: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, entry: &str) -> usize {
        lock(&self.entries).iter().filter(|e| *e == entry).count()
    }
}

/// Simulated host networking state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeHost {
    pub interfaces: BTreeSet<String>,
    pub dns: BTreeMap<String, Vec<IpAddr>>,
    pub search_domains: BTreeMap<String, Vec<String>>,
    pub routes: BTreeSet<Route>,
    pub dns_cache: usize,
}

impl FakeHost {
    const BASE_INTERFACES: [&'static str; 2] = ["lo", "eth0"];

    fn baseline() -> Self {
        Self {
            interfaces: Self::BASE_INTERFACES.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// True when nothing left by a tunnel remains.
    pub fn is_clean(&self) -> bool {
        self.interfaces
            .iter()
            .all(|i| Self::BASE_INTERFACES.contains(&i.as_str()))
            && self.dns.is_empty()
            && self.search_domains.is_empty()
            && self.routes.is_empty()
            && self.dns_cache == 0
    }

    fn drop_interface_state(&mut self, iface: &str) {
        self.dns.remove(iface);
        self.search_domains.remove(iface);
    }
}

#[derive(Debug, Default)]
struct FakeInner {
    host: FakeHost,
    calls: HashMap<&'static str, usize>,
    failing: HashSet<&'static str>,
}

/// In-memory [`Platform`].
#[derive(Debug, Clone)]
pub struct FakePlatform {
    inner: Arc<Mutex<FakeInner>>,
    journal: Journal,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::with_journal(Journal::new())
    }

    pub fn with_journal(journal: Journal) -> Self {
        let inner = FakeInner {
            host: FakeHost::baseline(),
            ..FakeInner::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            journal,
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Snapshot of the simulated host.
    pub fn host(&self) -> FakeHost {
        lock(&self.inner).host.clone()
    }

    /// Number of calls to a platform operation.
    pub fn calls(&self, op: &str) -> usize {
        lock(&self.inner).calls.get(op).copied().unwrap_or(0)
    }

    /// Make an operation fail from now on.
    pub fn fail_on(&self, op: &'static str) {
        lock(&self.inner).failing.insert(op);
    }

    /// Apply a tunnel's changes to the host, as the tunnel program would.
    pub fn apply(&self, record: &NetworkOverride) {
        let mut inner = lock(&self.inner);
        let host = &mut inner.host;
        let key = record
            .interface
            .clone()
            .unwrap_or_else(|| "global".to_string());
        if let Some(iface) = &record.interface {
            host.interfaces.insert(iface.clone());
        }
        if !record.dns_servers.is_empty() {
            host.dns.insert(key.clone(), record.dns_servers.clone());
            host.dns_cache += 1;
        }
        if !record.search_domains.is_empty() {
            host.search_domains.insert(key, record.search_domains.clone());
        }
        host.routes.extend(record.routes.iter().cloned());
    }

    /// Count, journal and possibly fail an operation, then mutate the host.
    fn op(
        &self,
        name: &'static str,
        mutate: impl FnOnce(&mut FakeHost),
    ) -> Result<(), PlatformError> {
        let mut inner = lock(&self.inner);
        *inner.calls.entry(name).or_insert(0) += 1;
        self.journal.record(format!("platform:{}", name));
        if inner.failing.contains(name) {
            return Err(PlatformError::Command {
                program: "fake".to_string(),
                code: Some(1),
                stderr: format!("{} failed", name),
            });
        }
        mutate(&mut inner.host);
        Ok(())
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn reset_dns(&self, interfaces: &[String]) -> Result<(), PlatformError> {
        self.op("reset_dns", |host| {
            for iface in interfaces {
                host.dns.remove(iface);
            }
            host.dns.remove("global");
        })
    }

    async fn clear_dns(&self, interfaces: &[String]) -> Result<(), PlatformError> {
        self.op("clear_dns", |host| {
            for iface in interfaces {
                host.search_domains.remove(iface);
            }
            host.search_domains.remove("global");
        })
    }

    async fn clear_dns_cache(&self) -> Result<(), PlatformError> {
        self.op("clear_dns_cache", |host| host.dns_cache = 0)
    }

    async fn flush_routes(&self) -> Result<(), PlatformError> {
        self.op("flush_routes", |host| host.routes.clear())
    }

    async fn remove_interface(&self, name: &str) -> Result<(), PlatformError> {
        self.op("remove_interface", |host| {
            host.interfaces.remove(name);
            host.drop_interface_state(name);
        })
    }

    async fn remove_route(&self, route: &Route) -> Result<(), PlatformError> {
        self.op("remove_route", |host| {
            host.routes.remove(route);
        })
    }

    async fn revert_dns(&self, record: &NetworkOverride) -> Result<(), PlatformError> {
        self.op("revert_dns", |host| {
            let key = record.interface.as_deref().unwrap_or("global");
            host.drop_interface_state(key);
        })
    }

    async fn list_interfaces(&self) -> Result<Vec<String>, PlatformError> {
        let mut inner = lock(&self.inner);
        *inner.calls.entry("list_interfaces").or_insert(0) += 1;
        if inner.failing.contains("list_interfaces") {
            return Err(PlatformError::Query("fake query failure".to_string()));
        }
        Ok(inner.host.interfaces.iter().cloned().collect())
    }

    async fn final_cleanup(&self) -> Result<(), PlatformError> {
        self.op("final_cleanup", |_| {})
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
