//! Per-service instance pools.
//!
//! An [`InstancePool`] owns the fixed list of endpoints configured for one
//! upstream service together with the bookkeeping the selection strategies
//! need. Health flags live in an immutable snapshot swapped atomically on
//! every flip, so selection never takes a lock; flips themselves are
//! serialized by a per-pool mutex.
use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::config::{HealthStatus, LoadBalanceStrategy, ServiceConfig};

/// Errors related to backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// A pool needs at least one endpoint
    #[error("Service '{0}' has no instances")]
    EmptyPool(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    /// The underlying URL as a string, without trailing slash
    url: String,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is a valid URL
    ///
    /// # Arguments
    /// * `url` - The URL string to validate and wrap
    ///
    /// # Returns
    /// A result containing the BackendUrl or an error
    pub fn new(url: &str) -> BackendResult<Self> {
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        Ok(BackendUrl {
            url: url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// One concrete address serving an upstream service.
///
/// Connection and outcome counters are atomics so the request path can
/// update them without touching the pool lock. The health flag itself is
/// owned by the pool snapshot, not by the endpoint.
#[derive(Debug)]
pub struct InstanceEndpoint {
    url: BackendUrl,
    weight: u32,
    health_path: Option<String>,
    active_connections: AtomicUsize,
    requests_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    /// EWMA of response latency in microseconds, 0 until the first sample
    avg_response_us: AtomicU64,
    /// Counter for consecutive successful probes
    pub consecutive_successes: AtomicU32,
    /// Counter for consecutive failed probes
    pub consecutive_failures: AtomicU32,
}

impl InstanceEndpoint {
    pub fn new(url: BackendUrl, weight: u32) -> Self {
        Self {
            url,
            weight: weight.max(1),
            health_path: None,
            active_connections: AtomicUsize::new(0),
            requests_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            avg_response_us: AtomicU64::new(0),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn with_health_path(mut self, path: Option<String>) -> Self {
        self.health_path = path;
        self
    }

    pub fn url(&self) -> &BackendUrl {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health_path(&self) -> Option<&str> {
        self.health_path.as_deref()
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_request(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_request(&self) {
        // Never wrap below zero even if a guard is dropped twice by mistake
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn record_outcome(&self, success: bool, elapsed: Duration) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let sample = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let _ = self
            .avg_response_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(if old == 0 {
                    sample
                } else {
                    (old / 10).saturating_mul(9).saturating_add(sample / 10)
                })
            });
    }

    pub(crate) fn stats(&self, healthy: bool) -> EndpointStats {
        EndpointStats {
            url: self.url.to_string(),
            weight: self.weight,
            status: if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            active_connections: self.active_connections(),
            requests_total: self.requests_total(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_response_ms: self.avg_response_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Point-in-time view of one endpoint, as exposed on the operational API.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointStats {
    pub url: String,
    pub weight: u32,
    pub status: HealthStatus,
    pub active_connections: usize,
    pub requests_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_ms: f64,
}

/// Immutable health view. Replaced wholesale on every flip.
#[derive(Debug)]
struct HealthSnapshot {
    flags: Vec<bool>,
    /// Indices of healthy endpoints in list order
    healthy: Vec<usize>,
}

impl HealthSnapshot {
    fn from_flags(flags: Vec<bool>) -> Self {
        let healthy = flags
            .iter()
            .enumerate()
            .filter_map(|(i, ok)| ok.then_some(i))
            .collect();
        Self { flags, healthy }
    }
}

/// Fixed set of endpoints for one service plus selection state.
#[derive(Debug)]
pub struct InstancePool {
    service_name: String,
    strategy: LoadBalanceStrategy,
    endpoints: Vec<Arc<InstanceEndpoint>>,
    health: ArcSwap<HealthSnapshot>,
    write_lock: Mutex<()>,
    cursor: AtomicUsize,
}

impl InstancePool {
    /// Build a pool; every endpoint starts healthy.
    pub fn new(
        service_name: impl Into<String>,
        strategy: LoadBalanceStrategy,
        endpoints: Vec<InstanceEndpoint>,
    ) -> BackendResult<Self> {
        let service_name = service_name.into();
        if endpoints.is_empty() {
            return Err(BackendError::EmptyPool(service_name));
        }
        let flags = vec![true; endpoints.len()];

        Ok(Self {
            service_name,
            strategy,
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            health: ArcSwap::from_pointee(HealthSnapshot::from_flags(flags)),
            write_lock: Mutex::new(()),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build a pool from its configuration block.
    pub fn from_config(service_name: &str, config: &ServiceConfig) -> BackendResult<Self> {
        let endpoints = config
            .instances
            .iter()
            .map(|instance| {
                BackendUrl::new(&instance.url).map(|url| {
                    InstanceEndpoint::new(url, instance.weight)
                        .with_health_path(instance.health_path.clone())
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        Self::new(service_name, config.strategy, endpoints)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    pub fn endpoints(&self) -> &[Arc<InstanceEndpoint>] {
        &self.endpoints
    }

    /// Look up an endpoint by url.
    pub fn endpoint(&self, url: &str) -> Option<&Arc<InstanceEndpoint>> {
        let url = url.trim_end_matches('/');
        self.endpoints.iter().find(|e| e.url.as_str() == url)
    }

    pub fn healthy_count(&self) -> usize {
        self.health.load().healthy.len()
    }

    pub fn is_healthy(&self, url: &str) -> Option<bool> {
        let url = url.trim_end_matches('/');
        let snapshot = self.health.load();
        self.endpoints
            .iter()
            .position(|e| e.url.as_str() == url)
            .map(|idx| snapshot.flags[idx])
    }

    /// Pick an endpoint from the healthy subset according to the pool strategy.
    ///
    /// Returns `None` when no endpoint is healthy; the cursor is not advanced in
    /// that case.
    pub fn select(&self) -> Option<Arc<InstanceEndpoint>> {
        let snapshot = self.health.load();
        let healthy = &snapshot.healthy;
        if healthy.is_empty() {
            return None;
        }

        let idx = match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(healthy),
            LoadBalanceStrategy::Random => Self::select_random(healthy),
            LoadBalanceStrategy::LeastConnections => self.select_least_connections(healthy),
            LoadBalanceStrategy::Weighted => self.select_weighted(healthy),
        };
        Some(self.endpoints[idx].clone())
    }

    fn select_round_robin(&self, healthy: &[usize]) -> usize {
        let count = self.cursor.fetch_add(1, Ordering::SeqCst);
        healthy[count % healthy.len()]
    }

    fn select_random(healthy: &[usize]) -> usize {
        healthy[rand::rng().random_range(0..healthy.len())]
    }

    fn select_least_connections(&self, healthy: &[usize]) -> usize {
        let mut best = healthy[0];
        let mut min_conns = self.endpoints[best].active_connections();
        for &idx in &healthy[1..] {
            let conns = self.endpoints[idx].active_connections();
            // Strict comparison keeps the earliest endpoint on ties
            if conns < min_conns {
                min_conns = conns;
                best = idx;
            }
        }
        best
    }

    fn select_weighted(&self, healthy: &[usize]) -> usize {
        let total: u64 = healthy
            .iter()
            .map(|&idx| u64::from(self.endpoints[idx].weight))
            .sum();
        let draw = rand::rng().random_range(0..total);

        let mut cumulative = 0u64;
        for &idx in healthy {
            cumulative += u64::from(self.endpoints[idx].weight);
            if draw < cumulative {
                return idx;
            }
        }
        healthy[healthy.len() - 1]
    }

    /// Set the health flag of `url`.
    ///
    /// Returns `None` if the url is not part of this pool, otherwise whether the
    /// flag actually changed.
    pub fn set_health(&self, url: &str, healthy: bool) -> Option<bool> {
        let url = url.trim_end_matches('/');
        let idx = self.endpoints.iter().position(|e| e.url.as_str() == url)?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.health.load();
        if current.flags[idx] == healthy {
            return Some(false);
        }

        let mut flags = current.flags.clone();
        flags[idx] = healthy;
        self.health
            .store(Arc::new(HealthSnapshot::from_flags(flags)));
        Some(true)
    }

    /// Snapshot of every endpoint in list order.
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        let snapshot = self.health.load();
        self.endpoints
            .iter()
            .zip(snapshot.flags.iter())
            .map(|(endpoint, &healthy)| endpoint.stats(healthy))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn pool(strategy: LoadBalanceStrategy, urls: &[&str]) -> InstancePool {
        let endpoints = urls
            .iter()
            .map(|u| InstanceEndpoint::new(BackendUrl::new(u).unwrap(), 1))
            .collect();
        InstancePool::new("svc", strategy, endpoints).unwrap()
    }

    fn pick(pool: &InstancePool) -> String {
        pool.select().unwrap().url().to_string()
    }

    #[test]
    fn test_backend_url_valid() {
        let backend_url = BackendUrl::new("http://example.com/").expect("valid HTTP URL");
        assert_eq!(backend_url.as_str(), "http://example.com");

        let secure = BackendUrl::new("https://secure.example.com").expect("valid HTTPS URL");
        assert_eq!(secure.to_string(), "https://secure.example.com");
    }

    #[test]
    fn test_backend_url_invalid() {
        assert!(BackendUrl::new("example.com").is_err());
        assert!(BackendUrl::new("ftp://example.com").is_err());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = InstancePool::new("svc", LoadBalanceStrategy::RoundRobin, vec![]);
        assert!(matches!(result, Err(BackendError::EmptyPool(_))));
    }

    #[test]
    fn test_round_robin_visits_each_once_per_cycle() {
        let pool = pool(
            LoadBalanceStrategy::RoundRobin,
            &["http://s1", "http://s2", "http://s3"],
        );

        assert_eq!(pick(&pool), "http://s1");
        assert_eq!(pick(&pool), "http://s2");
        assert_eq!(pick(&pool), "http://s3");
        assert_eq!(pick(&pool), "http://s1"); // Wraps around
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let pool = pool(
            LoadBalanceStrategy::RoundRobin,
            &["http://s1", "http://s2", "http://s3"],
        );
        pool.set_health("http://s2", false);

        let picks: Vec<String> = (0..4).map(|_| pick(&pool)).collect();
        assert!(picks.iter().all(|p| p != "http://s2"));
        assert_eq!(picks[0], picks[2]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_no_healthy_endpoint_does_not_advance_cursor() {
        let pool = pool(LoadBalanceStrategy::RoundRobin, &["http://s1", "http://s2"]);
        pool.set_health("http://s1", false);
        pool.set_health("http://s2", false);

        assert!(pool.select().is_none());
        assert!(pool.select().is_none());
        assert_eq!(pool.cursor.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_random_stays_within_healthy_subset() {
        let pool = pool(
            LoadBalanceStrategy::Random,
            &["http://s1", "http://s2", "http://s3"],
        );
        pool.set_health("http://s3", false);

        for _ in 0..200 {
            assert_ne!(pick(&pool), "http://s3");
        }
    }

    #[test]
    fn test_least_connections_prefers_idle_and_breaks_ties_in_order() {
        let pool = pool(
            LoadBalanceStrategy::LeastConnections,
            &["http://s1", "http://s2", "http://s3"],
        );

        // All idle: first in list order wins
        assert_eq!(pick(&pool), "http://s1");

        pool.endpoint("http://s1").unwrap().begin_request();
        pool.endpoint("http://s2").unwrap().begin_request();
        assert_eq!(pick(&pool), "http://s3");

        pool.endpoint("http://s3").unwrap().begin_request();
        pool.endpoint("http://s3").unwrap().begin_request();
        assert_eq!(pick(&pool), "http://s1");
    }

    #[test]
    fn test_weighted_respects_weights_of_healthy_endpoints() {
        let endpoints = vec![
            InstanceEndpoint::new(BackendUrl::new("http://heavy").unwrap(), 9),
            InstanceEndpoint::new(BackendUrl::new("http://light").unwrap(), 1),
            InstanceEndpoint::new(BackendUrl::new("http://down").unwrap(), 50),
        ];
        let pool = InstancePool::new("svc", LoadBalanceStrategy::Weighted, endpoints).unwrap();
        pool.set_health("http://down", false);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..2000 {
            *counts.entry(pick(&pool)).or_default() += 1;
        }

        assert!(!counts.contains_key("http://down"));
        assert!(counts["http://heavy"] > counts["http://light"] * 3);
    }

    #[test]
    fn test_set_health_is_idempotent() {
        let pool = pool(LoadBalanceStrategy::RoundRobin, &["http://s1"]);

        assert_eq!(pool.set_health("http://s1", true), Some(false));
        assert_eq!(pool.set_health("http://s1", false), Some(true));
        assert_eq!(pool.set_health("http://s1", false), Some(false));
        assert_eq!(pool.set_health("http://unknown", false), None);
        assert_eq!(pool.is_healthy("http://s1/"), Some(false));
    }

    #[test]
    fn test_end_request_never_underflows() {
        let endpoint = InstanceEndpoint::new(BackendUrl::new("http://s1").unwrap(), 1);
        endpoint.end_request();
        assert_eq!(endpoint.active_connections(), 0);

        endpoint.begin_request();
        assert_eq!(endpoint.active_connections(), 1);
        assert_eq!(endpoint.requests_total(), 1);
        endpoint.end_request();
        assert_eq!(endpoint.active_connections(), 0);
    }

    #[test]
    fn test_outcome_updates_latency_average() {
        let endpoint = InstanceEndpoint::new(BackendUrl::new("http://s1").unwrap(), 1);
        endpoint.record_outcome(true, Duration::from_millis(100));
        endpoint.record_outcome(false, Duration::from_millis(200));

        let stats = endpoint.stats(true);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!((stats.avg_response_ms - 110.0).abs() < 0.01);
    }
}
