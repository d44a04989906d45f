//! In-memory response cache with TTL expiry, prefix invalidation and an LRU bound.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;

/// Entries inspected when choosing an eviction victim
const EVICTION_SAMPLE: usize = 16;

/// A buffered upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedResponse,
    created_at: Instant,
    ttl: Duration,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.created_at
            .checked_add(self.ttl)
            .is_none_or(|expires_at| now < expires_at)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    /// Entries dropped for expiry or to make room
    pub evictions: u64,
}

pub struct ResponseCache {
    entries: scc::HashMap<String, CacheEntry>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Logical clock for LRU ordering
    tick: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: scc::HashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            tick: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_ttl_ms)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Build the cache key for a request.
    ///
    /// Layout: `{service}{normalized path}?{sorted query}#{METHOD}` followed by
    /// `;name=value` for every configured vary header present on the request.
    /// The service name always leads, so prefix invalidation by service works.
    pub fn cache_key(
        &self,
        service: &str,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> String {
        let mut key = String::with_capacity(service.len() + path.len() + 16);
        key.push_str(service);
        key.push_str(&normalize_path(path));

        key.push('?');
        if let Some(query) = query {
            let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            pairs.sort_unstable();
            key.push_str(&pairs.join("&"));
        }

        key.push('#');
        key.push_str(method.as_str());

        for name in &self.config.vary_headers {
            if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                key.push(';');
                key.push_str(&name.to_ascii_lowercase());
                key.push('=');
                key.push_str(value);
            }
        }
        key
    }

    /// Look up a fresh entry. Expired entries are removed and count as a miss.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let now = Instant::now();
        let found = match self.entries.get_async(key).await {
            Some(entry) if entry.get().is_fresh(now) => {
                entry
                    .get()
                    .last_access
                    .store(self.next_tick(), Ordering::Relaxed);
                Some(entry.get().value.clone())
            }
            Some(entry) => {
                let _ = entry.remove_entry();
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store `value` under `key` for `ttl`. Only 2xx responses are stored.
    ///
    /// Returns whether the value was stored.
    pub async fn put(&self, key: String, value: CachedResponse, ttl: Duration) -> bool {
        if !self.config.enabled || ttl.is_zero() || !value.status.is_success() {
            return false;
        }

        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
            last_access: AtomicU64::new(self.next_tick()),
        };

        if self.entries.get_async(key.as_str()).await.is_none() {
            self.make_room().await;
        }

        match self.entries.entry_async(key).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = entry;
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
        true
    }

    /// Drop every entry. Returns the number removed.
    pub async fn clear(&self) -> usize {
        let mut removed = 0;
        self.entries
            .retain_async(|_, _| {
                removed += 1;
                false
            })
            .await;
        tracing::info!(removed, "Cleared response cache");
        removed
    }

    /// Drop every entry whose key begins with `prefix`. Returns the exact count removed.
    pub async fn clear_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.entries
            .retain_async(|key, _| {
                if key.starts_with(prefix) {
                    removed += 1;
                    false
                } else {
                    true
                }
            })
            .await;
        tracing::info!(prefix, removed, "Cleared response cache by prefix");
        removed
    }

    /// Remove every expired entry. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries
            .retain_async(|_, entry| {
                if entry.is_fresh(now) {
                    true
                } else {
                    removed += 1;
                    false
                }
            })
            .await;
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Purge expired entries every `cache.sweep_interval_ms` until cancelled.
    pub async fn run_sweeper(&self, token: CancellationToken) {
        if self.config.sweep_interval_ms == 0 || !self.config.enabled {
            return;
        }
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Cache sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.purge_expired().await;
                }
            }
        }
    }

    /// Keep the entry count below `max_entries` before an insert.
    ///
    /// Eviction is approximate LRU: each round looks at a bounded sample of
    /// entries and drops an expired one if it finds it, else the least
    /// recently used of the sample. Full expiry scans belong to the sweeper.
    async fn make_room(&self) {
        while self.entries.len() >= self.config.max_entries {
            let Some(key) = self.eviction_candidate().await else {
                break;
            };
            if self.entries.remove_async(&key).await.is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Evicted cache entry to make room");
            }
        }
    }

    async fn eviction_candidate(&self) -> Option<String> {
        let now = Instant::now();
        let mut sampled = 0;
        let mut candidate: Option<(String, u64)> = None;
        self.entries
            .iter_async(|key, entry| {
                if !entry.is_fresh(now) {
                    candidate = Some((key.clone(), 0));
                    return false;
                }
                let access = entry.last_access.load(Ordering::Relaxed);
                if candidate.as_ref().is_none_or(|(_, tick)| access < *tick) {
                    candidate = Some((key.clone(), access));
                }
                sampled += 1;
                sampled < EVICTION_SAMPLE
            })
            .await;
        candidate.map(|(key, _)| key)
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Collapse duplicate slashes and drop a trailing slash (root stays `/`).
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}
