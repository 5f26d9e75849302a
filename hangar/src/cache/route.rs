//! Route cache
//!
//! Every invalidation bumps an epoch. A reader that fetched a record from the
//! store inserts it with [`RouteCache::insert_at`] and the epoch it read
//! before the fetch, so a record loaded before a concurrent invalidation is
//! dropped instead of cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::models::deployment::{Deployment, DeploymentStatus};

/// What the router needs to know about a subdomain's backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub deployment_id: String,
    pub port: Option<u16>,
    pub status: DeploymentStatus,
    pub error_message: Option<String>,
}

impl From<&Deployment> for RouteEntry {
    fn from(deployment: &Deployment) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            port: deployment.internal_port,
            status: deployment.status,
            error_message: deployment.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Cached {
    entry: RouteEntry,
    cached_at: Instant,
}

/// Subdomain to backend cache with a fixed TTL
pub struct RouteCache {
    entries: RwLock<HashMap<String, Cached>>,
    // only bumped while `entries` is write-locked
    epoch: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl RouteCache {
    /// Create a new route cache
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            ttl,
            capacity,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a fresh entry; expired entries count as misses
    pub fn get(&self, subdomain: &str) -> Option<RouteEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(subdomain)
            .filter(|c| c.cached_at.elapsed() < self.ttl)
            .map(|c| c.entry.clone())
    }

    /// Current invalidation epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Insert an entry, evicting the oldest when full
    pub fn insert(&self, subdomain: &str, entry: RouteEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        self.insert_locked(&mut entries, subdomain, entry);
    }

    /// Insert only if nothing was invalidated since `epoch` was read.
    /// Returns whether the entry was stored.
    pub fn insert_at(&self, subdomain: &str, entry: RouteEntry, epoch: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.insert_locked(&mut entries, subdomain, entry);
        true
    }

    fn insert_locked(&self, entries: &mut HashMap<String, Cached>, subdomain: &str, entry: RouteEntry) {
        if entries.len() >= self.capacity && !entries.contains_key(subdomain) {
            entries.retain(|_, c| c.cached_at.elapsed() < self.ttl);
            if entries.len() >= self.capacity {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, c)| c.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            subdomain.to_string(),
            Cached {
                entry,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop one subdomain
    pub fn invalidate(&self, subdomain: &str) -> Option<RouteEntry> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        self.epoch.fetch_add(1, Ordering::SeqCst);
        entries.remove(subdomain).map(|c| c.entry)
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        self.epoch.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
