//! In-memory response cache backed by a sharded map.

use super::ResponseStore;
use super::types::{CacheEntry, CacheKey, CacheStats};
use crate::context::GenerationResult;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// TTL cache of generation results.
///
/// Expired entries are never returned: reads expire them lazily and
/// [`ResponseCache::sweep`] removes whatever is left.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes one entry. Returns whether it existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drops every entry and resets the counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Runs [`ResponseStore::sweep`] every `interval` until `token` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }
}

impl ResponseStore for ResponseCache {
    fn get(&self, key: &CacheKey) -> Option<GenerationResult> {
        let now = Instant::now();
        // The read guard must be released before a stale entry is removed.
        let lookup = self.entries.get(key).map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                if self.entries.remove_if(key, |_, entry| entry.is_expired(now)).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Evicted stale cache entry on read");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: CacheKey, value: GenerationResult, ttl: Duration) {
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Caching response");
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, remaining = self.entries.len(), "Swept expired cache entries");
        }
        removed
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
