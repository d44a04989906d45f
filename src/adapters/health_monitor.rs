use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::{
    config::HealthCheckConfig,
    core::{GatewayService, instance_pool::InstanceEndpoint, load_balancer::LoadBalancer},
    ports::http_client::HttpClient,
};

/// Outcome of one probe in a health check cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub service: String,
    pub url: String,
    pub healthy: bool,
}

/// Background monitor that actively probes every instance of every pool
pub struct HealthMonitor {
    gateway_service: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
}

impl HealthMonitor {
    pub fn new(gateway_service: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            gateway_service,
            http_client,
        }
    }

    /// Run the probe loop until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let health_config = self.gateway_service.health_config();

        if !health_config.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        tracing::info!(
            interval_ms = health_config.interval_ms,
            timeout_ms = health_config.timeout_ms,
            path = %health_config.path,
            "Starting health monitor"
        );

        let mut interval = tokio::time::interval(Duration::from_millis(health_config.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate tick to give the server time to start up
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    // In-flight probes are dropped if cancellation wins mid-cycle
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::info!("Health monitor shutting down");
                            break;
                        }
                        _ = self.check_once() => {}
                    }
                }
            }
        }
    }

    /// Probe every endpoint once, concurrently, and apply the results.
    pub async fn check_once(&self) -> Vec<ProbeResult> {
        let health_config = self.gateway_service.health_config();
        let timeout = Duration::from_millis(health_config.timeout_ms);

        let targets: Vec<(Arc<LoadBalancer>, Arc<InstanceEndpoint>)> = self
            .gateway_service
            .pools()
            .balancers()
            .into_iter()
            .flat_map(|balancer| {
                balancer
                    .pool()
                    .endpoints()
                    .iter()
                    .map(|endpoint| (balancer.clone(), endpoint.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        tracing::debug!(instances = targets.len(), "Running health checks");

        let probes = targets.iter().map(|(_, endpoint)| {
            let url = format!(
                "{}{}",
                endpoint.url(),
                self.gateway_service.health_path(endpoint)
            );
            let client = self.http_client.clone();
            async move {
                // Bounded here as well in case the transport ignores its timeout
                tokio::time::timeout(timeout, client.probe(&url, timeout))
                    .await
                    .unwrap_or(false)
            }
        });
        let outcomes = join_all(probes).await;

        targets
            .iter()
            .zip(outcomes)
            .map(|((balancer, endpoint), healthy)| {
                if healthy {
                    Self::handle_probe_success(balancer, endpoint, health_config);
                } else {
                    Self::handle_probe_failure(balancer, endpoint, health_config);
                }
                ProbeResult {
                    service: balancer.service_name().to_string(),
                    url: endpoint.url().to_string(),
                    healthy,
                }
            })
            .collect()
    }

    fn handle_probe_success(
        balancer: &LoadBalancer,
        endpoint: &InstanceEndpoint,
        health_config: &HealthCheckConfig,
    ) {
        let successes = endpoint.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        endpoint.consecutive_failures.store(0, Ordering::Relaxed);

        tracing::debug!(
            instance = %endpoint.url(),
            successes,
            "Health check succeeded"
        );

        if successes >= health_config.healthy_threshold {
            balancer.mark_healthy(endpoint.url().as_str());
        }
    }

    fn handle_probe_failure(
        balancer: &LoadBalancer,
        endpoint: &InstanceEndpoint,
        health_config: &HealthCheckConfig,
    ) {
        let failures = endpoint.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        endpoint.consecutive_successes.store(0, Ordering::Relaxed);

        tracing::debug!(
            instance = %endpoint.url(),
            failures,
            threshold = health_config.unhealthy_threshold,
            "Health check failed"
        );

        if failures >= health_config.unhealthy_threshold {
            balancer.mark_unhealthy(endpoint.url().as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Mutex, atomic::AtomicUsize},
    };

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        config::{GatewayConfig, InstanceConfig, LoadBalanceStrategy, RouteConfig, ServiceConfig},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    /// Probe answers driven by a set of failing urls
    #[derive(Default)]
    struct ScriptedProbe {
        failing: Mutex<HashSet<String>>,
        hanging: Mutex<HashSet<String>>,
        probed: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn fail(&self, url: &str) {
            self.failing.lock().unwrap().insert(url.to_string());
        }

        fn recover(&self, url: &str) {
            self.failing.lock().unwrap().remove(url);
        }

        fn hang(&self, url: &str) {
            self.hanging.lock().unwrap().insert(url.to_string());
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedProbe {
        async fn forward(
            &self,
            _req: Request<AxumBody>,
            timeout: Duration,
        ) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::Timeout(timeout))
        }

        async fn probe(&self, url: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.probed.lock().unwrap().push(url.to_string());
            let hanging = self.hanging.lock().unwrap().contains(url);
            if hanging {
                std::future::pending::<()>().await;
            }
            !self.failing.lock().unwrap().contains(url)
        }
    }

    fn gateway(health: HealthCheckConfig) -> Arc<GatewayService> {
        let mut users = ServiceConfig::new(
            LoadBalanceStrategy::RoundRobin,
            ["http://users-1:8080", "http://users-2:8080"],
        );
        users.instances[1] = InstanceConfig {
            health_path: Some("/ready".to_string()),
            ..InstanceConfig::new("http://users-2:8080")
        };
        let config = GatewayConfig::builder()
            .listen_addr("127.0.0.1:0")
            .service("users", users)
            .route("/users", RouteConfig::new("users"))
            .health_check(health)
            .build()
            .unwrap();
        Arc::new(GatewayService::new(Arc::new(config)).unwrap())
    }

    fn healthy_urls(gw: &GatewayService) -> Vec<String> {
        gw.pools()
            .get("users")
            .unwrap()
            .stats()
            .instances
            .into_iter()
            .filter(|i| i.status == crate::config::HealthStatus::Healthy)
            .map(|i| i.url)
            .collect()
    }

    #[tokio::test]
    async fn test_probe_uses_instance_health_path() {
        let gw = gateway(HealthCheckConfig::default());
        let client = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(gw, client.clone());

        monitor.check_once().await;

        let mut probed = client.probed.lock().unwrap().clone();
        probed.sort();
        assert_eq!(
            probed,
            vec![
                "http://users-1:8080/health".to_string(),
                "http://users-2:8080/ready".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_probe_marks_unhealthy_and_recovery_readmits() {
        let gw = gateway(HealthCheckConfig::default());
        let client = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(gw.clone(), client.clone());

        client.fail("http://users-1:8080/health");
        let results = monitor.check_once().await;
        assert_eq!(results.iter().filter(|r| !r.healthy).count(), 1);
        assert_eq!(healthy_urls(&gw), vec!["http://users-2:8080"]);

        client.recover("http://users-1:8080/health");
        monitor.check_once().await;
        assert_eq!(healthy_urls(&gw).len(), 2);
    }

    #[tokio::test]
    async fn test_thresholds_require_consecutive_results() {
        let gw = gateway(HealthCheckConfig {
            unhealthy_threshold: 2,
            healthy_threshold: 2,
            ..HealthCheckConfig::default()
        });
        let client = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(gw.clone(), client.clone());

        client.fail("http://users-1:8080/health");
        monitor.check_once().await;
        assert_eq!(healthy_urls(&gw).len(), 2);
        monitor.check_once().await;
        assert_eq!(healthy_urls(&gw).len(), 1);

        client.recover("http://users-1:8080/health");
        monitor.check_once().await;
        assert_eq!(healthy_urls(&gw).len(), 1);
        monitor.check_once().await;
        assert_eq!(healthy_urls(&gw).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out_without_blocking_others() {
        let gw = gateway(HealthCheckConfig {
            timeout_ms: 500,
            ..HealthCheckConfig::default()
        });
        let client = Arc::new(ScriptedProbe::default());
        client.hang("http://users-2:8080/ready");
        let monitor = HealthMonitor::new(gw.clone(), client.clone());

        let results = monitor.check_once().await;
        assert_eq!(results.len(), 2);
        assert_eq!(healthy_urls(&gw), vec!["http://users-1:8080"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probes_each_interval_until_cancelled() {
        let gw = gateway(HealthCheckConfig {
            interval_ms: 1_000,
            ..HealthCheckConfig::default()
        });
        let client = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(gw, client.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let token = token.clone();
            async move { monitor.run(token).await }
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_monitor_returns_immediately() {
        let gw = gateway(HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        });
        let client = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(gw, client.clone());

        monitor.run(CancellationToken::new()).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
