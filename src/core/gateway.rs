//! Core gateway orchestration service.
//!
//! The `GatewayService` aggregates immutable configuration (`GatewayConfig`)
//! with the runtime state shared by every request. It provides:
//! * Longest‑prefix route lookup and prefix rewriting
//! * Access to the per‑service load balancers (`PoolRegistry`)
//! * Access to the lazily populated circuit breakers
//! * The shared response cache and its TTL policy
//! * Operational snapshots for the admin API
//!
//! Nothing here performs I/O; the transport lives behind `ports::http_client`.
use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    config::{GatewayConfig, HealthCheckConfig, RouteConfig},
    core::{
        circuit_breaker::{BreakerStats, CircuitBreakerRegistry},
        instance_pool::{BackendResult, InstanceEndpoint},
        load_balancer::{PoolRegistry, PoolStats},
        response_cache::{CacheStats, ResponseCache},
    },
};

/// Central registry built once at startup and shared through `Arc`.
///
/// Construct with [`GatewayService::new`] by passing an `Arc<GatewayConfig>`.
/// Instance pools are built eagerly; breakers are created on first use.
#[derive(Debug)]
pub struct GatewayService {
    config: Arc<GatewayConfig>,
    pools: PoolRegistry,
    breakers: CircuitBreakerRegistry,
    cache: ResponseCache,
}

/// One service on the operational API: pool state plus its breaker.
#[derive(Debug, Serialize)]
pub struct ServiceSnapshot {
    #[serde(flatten)]
    pub pool: PoolStats,
    pub circuit_breaker: BreakerStats,
}

#[derive(Debug, Serialize)]
pub struct GatewaySnapshot {
    pub services: Vec<ServiceSnapshot>,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthSummary {
    /// `ok` when every instance is healthy, `degraded` when some are, `down` when none are
    pub status: &'static str,
    pub healthy_instances: usize,
    pub total_instances: usize,
}

impl GatewayService {
    /// Create a new gateway service from a gateway configuration.
    pub fn new(config: Arc<GatewayConfig>) -> BackendResult<Self> {
        let pools = PoolRegistry::from_config(&config.services)?;
        let breakers = CircuitBreakerRegistry::from_config(&config);
        let cache = ResponseCache::new(config.cache.clone());

        Ok(Self {
            config,
            pools,
            breakers,
            cache,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Longest‑prefix match to find a route configuration for an incoming path.
    pub fn find_matching_route(&self, path: &str) -> Option<(&str, &RouteConfig)> {
        self.config
            .routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, config)| (prefix.as_str(), config))
    }

    /// Replace the matched `prefix` with the route's `path_rewrite`, if any.
    pub fn rewrite_path(prefix: &str, route: &RouteConfig, path: &str) -> String {
        let Some(replacement) = &route.path_rewrite else {
            return path.to_string();
        };
        let rest = path.strip_prefix(prefix).unwrap_or(path);

        let mut rewritten = replacement.trim_end_matches('/').to_string();
        if !rest.is_empty() && !rest.starts_with('/') {
            rewritten.push('/');
        }
        rewritten.push_str(rest);
        if rewritten.is_empty() {
            rewritten.push('/');
        }
        rewritten
    }

    /// TTL for responses cached on `route`: the route override, else the cache default.
    pub fn cache_ttl(&self, route: &RouteConfig) -> Duration {
        route
            .cache_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.cache.default_ttl())
    }

    /// Return the global health check configuration.
    pub fn health_config(&self) -> &HealthCheckConfig {
        &self.config.health_check
    }

    /// Resolve the health probe path for an endpoint (per‑instance override or global default).
    pub fn health_path(&self, endpoint: &InstanceEndpoint) -> String {
        endpoint
            .health_path()
            .map(str::to_string)
            .unwrap_or_else(|| self.config.health_check.path.clone())
    }

    /// Pool, breaker and cache state for the operational API.
    pub async fn snapshot(&self) -> GatewaySnapshot {
        let mut services = Vec::with_capacity(self.pools.len());
        for balancer in self.pools.balancers() {
            let breaker = self.breakers.breaker(balancer.service_name()).await;
            services.push(ServiceSnapshot {
                pool: balancer.stats(),
                circuit_breaker: breaker.stats(),
            });
        }

        GatewaySnapshot {
            services,
            cache: self.cache.stats(),
        }
    }

    pub fn health_summary(&self) -> HealthSummary {
        let (healthy, total) = self
            .pools
            .balancers()
            .iter()
            .fold((0, 0), |(healthy, total), balancer| {
                let pool = balancer.pool();
                (
                    healthy + pool.healthy_count(),
                    total + pool.endpoints().len(),
                )
            });

        let status = if healthy == total {
            "ok"
        } else if healthy == 0 {
            "down"
        } else {
            "degraded"
        };

        HealthSummary {
            status,
            healthy_instances: healthy,
            total_instances: total,
        }
    }
}
