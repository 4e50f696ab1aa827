//! Service registry mapping synthetic hostnames to tunnel endpoints
//!
//! The registry is written by the registration loop and read by every
//! in-flight proxy request. Readers share a read lock, the writer takes the
//! write lock; no I/O ever happens while either is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

/// A published hostname and the local address its tunnel listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Synthetic hostname including the remote port, e.g. `api.default.svc.cluster.local:80`
    pub hostname: String,
    /// Local tunnel endpoint, e.g. `127.0.0.1:9001`
    pub backend_address: String,
}

impl RegistryEntry {
    /// Hostname without the trailing `:<port>`
    pub fn host(&self) -> &str {
        strip_port(&self.hostname)
    }

    /// IP (or host) portion of the backend address
    pub fn backend_ip(&self) -> &str {
        strip_port(&self.backend_address)
    }
}

fn strip_port(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// Registry of tunneled services
///
/// One hostname maps to exactly one backend. Lookups are exact string
/// matches; callers are expected to pass the `Host` header as received.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    routes: RwLock<HashMap<String, String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    // A panic while holding the lock cannot leave a half-written String in
    // the map, so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lookup the backend address for a hostname
    pub fn get(&self, hostname: &str) -> Option<String> {
        let backend = self.read().get(hostname).cloned();
        trace!(hostname, found = backend.is_some(), "Registry lookup");
        backend
    }

    /// Insert or overwrite the backend for a hostname
    ///
    /// Returns the previous backend if one was replaced.
    pub fn put(
        &self,
        hostname: impl Into<String>,
        backend_address: impl Into<String>,
    ) -> Option<String> {
        let hostname = hostname.into();
        let backend_address = backend_address.into();
        debug!(hostname = %hostname, backend = %backend_address, "Publishing route");

        self.write().insert(hostname, backend_address)
    }

    /// Check whether a hostname has been published
    pub fn contains(&self, hostname: &str) -> bool {
        self.read().contains_key(hostname)
    }

    /// Point-in-time copy of every route, ordered by hostname
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read()
            .iter()
            .map(|(hostname, backend)| (hostname.clone(), backend.clone()))
            .collect()
    }

    /// Snapshot as a list of entries, ordered by hostname
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.snapshot()
            .into_iter()
            .map(|(hostname, backend_address)| RegistryEntry {
                hostname,
                backend_address,
            })
            .collect()
    }

    /// Number of published routes
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
