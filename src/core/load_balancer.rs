use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    config::{LoadBalanceStrategy, ServiceConfig},
    core::instance_pool::{BackendResult, BackendUrl, EndpointStats, InstanceEndpoint, InstancePool},
};

/// Errors returned when a service cannot be dispatched to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadBalancerError {
    /// Every endpoint in the pool is currently marked unhealthy
    #[error("No healthy instance available for service '{0}'")]
    Unavailable(String),
}

/// Load balancer for a single service.
///
/// Selection goes through the pool's strategy over the healthy subset only.
/// Health flips from the request path and from the health monitor both go
/// through [`LoadBalancer::mark_healthy`] / [`LoadBalancer::mark_unhealthy`].
#[derive(Debug)]
pub struct LoadBalancer {
    pool: InstancePool,
}

impl LoadBalancer {
    pub fn new(pool: InstancePool) -> Self {
        Self { pool }
    }

    pub fn from_config(service_name: &str, config: &ServiceConfig) -> BackendResult<Self> {
        InstancePool::from_config(service_name, config).map(Self::new)
    }

    pub fn service_name(&self) -> &str {
        self.pool.service_name()
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Pick the next endpoint and reserve a connection slot on it.
    pub fn next_endpoint(&self) -> Result<EndpointLease, LoadBalancerError> {
        match self.pool.select() {
            Some(endpoint) => Ok(EndpointLease::acquire(endpoint)),
            None => {
                tracing::warn!(
                    service = %self.pool.service_name(),
                    "No healthy instance available"
                );
                Err(LoadBalancerError::Unavailable(
                    self.pool.service_name().to_string(),
                ))
            }
        }
    }

    /// Mark `url` healthy. Returns `false` if the url is not part of this pool.
    pub fn mark_healthy(&self, url: &str) -> bool {
        self.set_health(url, true)
    }

    /// Mark `url` unhealthy. Returns `false` if the url is not part of this pool.
    pub fn mark_unhealthy(&self, url: &str) -> bool {
        self.set_health(url, false)
    }

    fn set_health(&self, url: &str, healthy: bool) -> bool {
        match self.pool.set_health(url, healthy) {
            None => {
                tracing::debug!(
                    service = %self.pool.service_name(),
                    instance = %url,
                    "Ignoring health update for unknown instance"
                );
                false
            }
            Some(changed) => {
                if changed {
                    if healthy {
                        tracing::info!(
                            service = %self.pool.service_name(),
                            instance = %url,
                            "Instance is now HEALTHY"
                        );
                    } else {
                        tracing::warn!(
                            service = %self.pool.service_name(),
                            instance = %url,
                            "Instance is now UNHEALTHY"
                        );
                    }
                }
                true
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let instances = self.pool.endpoint_stats();
        PoolStats {
            service: self.pool.service_name().to_string(),
            strategy: self.pool.strategy(),
            healthy_instances: self.pool.healthy_count(),
            total_instances: instances.len(),
            instances,
        }
    }
}

/// Per-service view for the operational API.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub service: String,
    pub strategy: LoadBalanceStrategy,
    pub healthy_instances: usize,
    pub total_instances: usize,
    pub instances: Vec<EndpointStats>,
}

/// A reserved connection slot on one endpoint.
///
/// Dropping the lease releases the slot. Call [`EndpointLease::record_success`]
/// or [`EndpointLease::record_failure`] to feed the outcome and latency into the
/// endpoint counters; the slot stays reserved until the lease itself goes away.
#[derive(Debug)]
pub struct EndpointLease {
    endpoint: Arc<InstanceEndpoint>,
    started: Instant,
}

impl EndpointLease {
    pub fn acquire(endpoint: Arc<InstanceEndpoint>) -> Self {
        endpoint.begin_request();
        Self {
            endpoint,
            started: Instant::now(),
        }
    }

    pub fn url(&self) -> &BackendUrl {
        self.endpoint.url()
    }

    pub fn endpoint(&self) -> &Arc<InstanceEndpoint> {
        &self.endpoint
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_success(&self) {
        self.endpoint.record_outcome(true, self.elapsed());
    }

    pub fn record_failure(&self) {
        self.endpoint.record_outcome(false, self.elapsed());
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.endpoint.end_request();
    }
}

/// One load balancer per configured service. Built at startup, never resized.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    balancers: HashMap<String, Arc<LoadBalancer>>,
}

impl PoolRegistry {
    pub fn from_config(services: &HashMap<String, ServiceConfig>) -> BackendResult<Self> {
        let mut balancers = HashMap::with_capacity(services.len());
        for (name, service) in services {
            let balancer = LoadBalancer::from_config(name, service)?;
            tracing::debug!(
                service = %name,
                strategy = %service.strategy,
                instances = service.instances.len(),
                "Registered instance pool"
            );
            balancers.insert(name.clone(), Arc::new(balancer));
        }
        Ok(Self { balancers })
    }

    pub fn get(&self, service: &str) -> Option<&Arc<LoadBalancer>> {
        self.balancers.get(service)
    }

    /// Balancers ordered by service name.
    pub fn balancers(&self) -> Vec<&Arc<LoadBalancer>> {
        let mut balancers: Vec<_> = self.balancers.values().collect();
        balancers.sort_by(|a, b| a.service_name().cmp(b.service_name()));
        balancers
    }

    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}
