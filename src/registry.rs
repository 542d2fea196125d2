//! Host lookup over an immutable snapshot of resolved services
//!
//! Request handlers take an `Arc` of the current [`ServiceRegistry`] and use
//! it for the whole request. A reload builds a new registry and swaps it in
//! as a whole; nothing is mutated in place.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::resolver::{Resolution, ServiceRecord};

/// Exact-match lookup from `Host` header value to service
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceRecord>>,
}

impl ServiceRegistry {
    pub fn new(services: HashMap<String, ServiceRecord>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|(host, record)| (host.to_lowercase(), Arc::new(record)))
                .collect(),
        }
    }

    pub fn from_resolution(resolution: Resolution) -> Self {
        Self::new(resolution.services)
    }

    /// Find the service for a `Host` header value.
    ///
    /// Matching is case-insensitive and exact. A value with a `:port` suffix
    /// that has no exact entry is retried without the port.
    pub fn lookup(&self, host_header: &str) -> Option<Arc<ServiceRecord>> {
        let host = host_header.trim().to_lowercase();
        if host.is_empty() {
            return None;
        }

        if let Some(record) = self.services.get(&host) {
            return Some(Arc::clone(record));
        }

        let (name, port) = host.rsplit_once(':')?;
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        self.services.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Hosts in sorted order
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.services.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        hosts
    }
}

/// Differences applied by a registry swap
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ReloadResult {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// The current registry snapshot, shared by all request handlers
#[derive(Debug, Default)]
pub struct SharedRegistry {
    current: RwLock<Arc<ServiceRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// The snapshot to use for one request
    pub fn snapshot(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot and report what changed
    pub fn replace(&self, next: ServiceRegistry) -> ReloadResult {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.current.write(), Arc::clone(&next));

        let mut result = ReloadResult::default();
        for (host, record) in &next.services {
            match previous.services.get(host) {
                None => result.added.push(host.clone()),
                Some(old) if old != record => result.updated.push(host.clone()),
                Some(_) => {}
            }
        }
        for host in previous.services.keys() {
            if !next.services.contains_key(host) {
                result.removed.push(host.clone());
            }
        }

        result.added.sort();
        result.removed.sort();
        result.updated.sort();
        result
    }
}
