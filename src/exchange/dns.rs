//! Per-iteration DNS memoization for the HTTP client.
//!
//! The control loop calls [`DnsCache::clear`] at the start of every
//! iteration; within an iteration each host is resolved at most once.
//! The cache is a latency optimization only. Two tasks racing on a miss
//! both resolve and the last write wins.

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DnsKey {
    host: String,
    port: u16,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<DnsKey, Vec<SocketAddr>>>,
    resolutions: AtomicUsize,
}

/// Shared resolver cache, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct DnsCache {
    inner: Arc<Inner>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `host`, answering from the cache when possible.
    pub async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let key = DnsKey {
            host: host.to_string(),
            port,
        };

        if let Some(addrs) = self.get(&key) {
            return Ok(addrs);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        self.inner.resolutions.fetch_add(1, Ordering::Relaxed);
        debug!(%host, count = addrs.len(), "Resolved host");

        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.insert(key, addrs.clone());
        }
        Ok(addrs)
    }

    fn get(&self, key: &DnsKey) -> Option<Vec<SocketAddr>> {
        self.inner
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lookups that went to the system resolver.
    pub fn resolutions(&self) -> usize {
        self.inner.resolutions.load(Ordering::Relaxed)
    }
}

impl Resolve for DnsCache {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = self.clone();
        Box::pin(async move {
            // reqwest overrides the port on returned addresses.
            let addrs = cache.lookup(name.as_str(), 0).await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}
