//! Configuration data structures for Switchyard.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde‑friendly and include defaults so that minimal configs remain concise.
//! Builders and enums here are considered part of the public API for embedding.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_weight() -> u32 {
    1
}

fn default_route_timeout_ms() -> u64 {
    30_000
}

/// Top level gateway configuration. Loaded once at startup; immutable afterwards.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Upstream services keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Routes keyed by path prefix
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Breaker settings for a service: the per-service override if present, else the global block.
    pub fn breaker_config_for(&self, service: &str) -> &CircuitBreakerConfig {
        self.services
            .get(service)
            .and_then(|s| s.circuit_breaker.as_ref())
            .unwrap_or(&self.circuit_breaker)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            services: HashMap::new(),
            routes: HashMap::new(),
        }
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    health_check: Option<HealthCheckConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    cache: Option<CacheConfig>,
    services: HashMap<String, ServiceConfig>,
    routes: HashMap<String, RouteConfig>,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Register an upstream service
    pub fn service(mut self, name: impl Into<String>, config: ServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    /// Add a route with the given path prefix and configuration
    pub fn route(mut self, path_prefix: impl Into<String>, config: RouteConfig) -> Self {
        self.routes.insert(path_prefix.into(), config);
        self
    }

    /// Set health check configuration
    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    /// Set the default circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Set response cache configuration
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        if self.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }

        Ok(GatewayConfig {
            listen_addr,
            health_check: self.health_check.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            services: self.services,
            routes: self.routes,
        })
    }
}

/// A logical upstream backed by a fixed list of instances.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    pub instances: Vec<InstanceConfig>,
    /// Overrides the global circuit breaker settings for this service
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ServiceConfig {
    /// Service with unit-weight instances at the given urls.
    pub fn new<I, S>(strategy: LoadBalanceStrategy, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            strategy,
            instances: urls.into_iter().map(InstanceConfig::new).collect(),
            circuit_breaker: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Probe path override; falls back to `health_check.path`
    #[serde(default)]
    pub health_path: Option<String>,
}

impl InstanceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: default_weight(),
            health_path: None,
        }
    }

    pub fn weighted(url: impl Into<String>, weight: u32) -> Self {
        Self {
            weight,
            ..Self::new(url)
        }
    }
}

/// Route definition: every request whose path starts with the key prefix goes to `service`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub service: String,
    /// Replacement for the matched prefix before forwarding (e.g. "/api/users" -> "/users")
    #[serde(default)]
    pub path_rewrite: Option<String>,
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-route TTL; falls back to `cache.default_ttl_ms`
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
    /// Allowed methods (uppercase). Empty or absent means any method.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

impl RouteConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            path_rewrite: None,
            cacheable: false,
            timeout_ms: default_route_timeout_ms(),
            cache_ttl_ms: None,
            methods: None,
        }
    }

    pub fn cacheable(mut self, ttl_ms: Option<u64>) -> Self {
        self.cacheable = true;
        self.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn rewrite(mut self, replacement: impl Into<String>) -> Self {
        self.path_rewrite = Some(replacement.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Whether the route accepts the given method
    pub fn allows_method(&self, method: &str) -> bool {
        match &self.methods {
            Some(methods) if !methods.is_empty() => {
                methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            }
            _ => true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub path: String,
    /// Consecutive probe failures before an instance is marked unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive probe successes before an instance is re-admitted
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 2_000,
            path: "/health".to_string(),
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays OPEN before trial requests are admitted
    pub reset_timeout_ms: u64,
    /// Trial requests admitted in HALF_OPEN; that many successes close the circuit
    pub half_open_trial_count: u32,
    /// Count upstream 5xx responses as breaker failures
    pub count_5xx_as_failure: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_trial_count: 1,
            count_5xx_as_failure: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_ms: u64,
    /// Upper bound on stored entries; least recently used entries are evicted beyond it
    pub max_entries: usize,
    /// Interval of the expired-entry sweeper; 0 disables it
    pub sweep_interval_ms: u64,
    /// Request headers whose values become part of the cache key
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: 60_000,
            max_entries: 10_000,
            sweep_interval_ms: 30_000,
            vary_headers: vec!["accept".to_string()],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    Weighted,
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalanceStrategy::Random => write!(f, "random"),
            LoadBalanceStrategy::LeastConnections => write!(f, "least_connections"),
            LoadBalanceStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_routes() {
        let result = GatewayConfig::builder().listen_addr("127.0.0.1:8080").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_breaker_override_per_service() {
        let mut svc = ServiceConfig::new(LoadBalanceStrategy::RoundRobin, ["http://a:1"]);
        svc.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });
        let config = GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .service("svc-a", svc)
            .service(
                "svc-b",
                ServiceConfig::new(LoadBalanceStrategy::Random, ["http://b:1"]),
            )
            .route("/a", RouteConfig::new("svc-a"))
            .build()
            .unwrap();

        assert_eq!(config.breaker_config_for("svc-a").failure_threshold, 2);
        assert_eq!(config.breaker_config_for("svc-b").failure_threshold, 5);
        assert_eq!(config.breaker_config_for("unknown").failure_threshold, 5);
    }

    #[test]
    fn test_route_method_allow_list() {
        let mut route = RouteConfig::new("svc");
        assert!(route.allows_method("DELETE"));

        route.methods = Some(vec!["GET".to_string(), "POST".to_string()]);
        assert!(route.allows_method("get"));
        assert!(!route.allows_method("DELETE"));
    }
}
