// Test for circuit breaking and health tracking seen through the request path
mod common;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use hyper::StatusCode;
    use switchyard::{
        HealthMonitor,
        config::{
            CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, LoadBalanceStrategy,
            RouteConfig, ServiceConfig,
        },
        core::CircuitState,
    };

    use crate::common::{Failure, MockUpstream, build, get, json_body};

    const ORDERS_1: &str = "http://orders-1:8000";
    const ORDERS_2: &str = "http://orders-2:8000";

    fn orders_config(instances: &[&str]) -> GatewayConfig {
        GatewayConfig::builder()
            .listen_addr("127.0.0.1:0")
            .health_check(HealthCheckConfig {
                interval_ms: 1_000,
                timeout_ms: 200,
                unhealthy_threshold: 2,
                healthy_threshold: 1,
                ..HealthCheckConfig::default()
            })
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout_ms: 1_000,
                half_open_trial_count: 1,
                count_5xx_as_failure: true,
            })
            .service(
                "orders",
                ServiceConfig::new(LoadBalanceStrategy::RoundRobin, instances.iter().copied()),
            )
            .route("/orders", RouteConfig::new("orders"))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_then_recovers_after_reset_timeout() {
        let upstream = MockUpstream::new();
        upstream.respond_with(ORDERS_1, StatusCode::INTERNAL_SERVER_ERROR);
        let (gateway, router) = build(orders_config(&[ORDERS_1]), upstream.clone());

        for _ in 0..2 {
            let response = router.handle_request(get("/orders"), None).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        let breaker = gateway.breakers().breaker("orders").await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejected without touching the upstream
        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["error"], "circuit-open");
        assert_eq!(body["service"], "orders");
        assert_eq!(upstream.forward_count(), 2);

        // 5xx responses do not evict the instance from the pool
        let pool = gateway.pools().get("orders").unwrap().pool();
        assert_eq!(pool.is_healthy(ORDERS_1), Some(true));

        upstream.respond_with(ORDERS_1, StatusCode::OK);
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(upstream.forward_count(), 3);
        assert_eq!(breaker.stats().times_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_circuit() {
        let upstream = MockUpstream::new();
        upstream.respond_with(ORDERS_1, StatusCode::SERVICE_UNAVAILABLE);
        let (gateway, router) = build(orders_config(&[ORDERS_1]), upstream.clone());

        router.handle_request(get("/orders"), None).await;
        router.handle_request(get("/orders"), None).await;

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let breaker = gateway.breakers().breaker("orders").await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().times_opened, 2);

        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(json_body(response).await["error"], "circuit-open");
        assert_eq!(upstream.forward_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_permit_returned_when_pool_is_empty() {
        let upstream = MockUpstream::new();
        upstream.respond_with(ORDERS_1, StatusCode::BAD_GATEWAY);
        let (gateway, router) = build(orders_config(&[ORDERS_1]), upstream.clone());

        router.handle_request(get("/orders"), None).await;
        router.handle_request(get("/orders"), None).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let balancer = gateway.pools().get("orders").unwrap();
        balancer.mark_unhealthy(ORDERS_1);

        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(json_body(response).await["error"], "no-healthy-instance");

        // The unused trial permit lets the next request probe the service
        balancer.mark_healthy(ORDERS_1);
        upstream.respond_with(ORDERS_1, StatusCode::OK);
        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let breaker = gateway.breakers().breaker("orders").await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_request_does_not_wedge_breaker() {
        let mut config = orders_config(&[ORDERS_1]);
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 100,
            half_open_trial_count: 1,
            count_5xx_as_failure: true,
        };
        let upstream = MockUpstream::new();
        upstream.respond_with(ORDERS_1, StatusCode::INTERNAL_SERVER_ERROR);
        let (gateway, router) = build(config, upstream.clone());
        let breaker = gateway.breakers().breaker("orders").await;

        router.handle_request(get("/orders"), None).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(150)).await;

        // The trial request hangs upstream and the client goes away
        upstream.fail(ORDERS_1, Failure::Hang);
        let trial = tokio::spawn({
            let router = router.clone();
            async move { router.handle_request(get("/orders"), None).await }
        });
        while upstream.forward_count() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(json_body(response).await["error"], "circuit-open");

        trial.abort();
        assert!(trial.await.unwrap_err().is_cancelled());
        tokio::time::advance(Duration::from_millis(150)).await;

        upstream.recover(ORDERS_1);
        upstream.respond_with(ORDERS_1, StatusCode::OK);
        let response = router.handle_request(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let endpoint = gateway
            .pools()
            .get("orders")
            .unwrap()
            .pool()
            .endpoint(ORDERS_1)
            .unwrap()
            .clone();
        drop(response);
        assert_eq!(endpoint.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_breakers_are_isolated_per_service() {
        let config = {
            let mut config = orders_config(&[ORDERS_1]);
            config.services.insert(
                "billing".to_string(),
                ServiceConfig::new(LoadBalanceStrategy::RoundRobin, ["http://billing:7000"]),
            );
            config
                .routes
                .insert("/billing".to_string(), RouteConfig::new("billing"));
            config
        };
        let upstream = MockUpstream::new();
        upstream.respond_with(ORDERS_1, StatusCode::INTERNAL_SERVER_ERROR);
        let (_, router) = build(config, upstream.clone());

        router.handle_request(get("/orders"), None).await;
        router.handle_request(get("/orders"), None).await;

        let orders = router.handle_request(get("/orders"), None).await;
        assert_eq!(json_body(orders).await["error"], "circuit-open");

        let billing = router.handle_request(get("/billing/invoices"), None).await;
        assert_eq!(billing.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_probe_failures_remove_instance_after_threshold() {
        let upstream = MockUpstream::new();
        let (gateway, router) = build(orders_config(&[ORDERS_1, ORDERS_2]), upstream.clone());
        let monitor = HealthMonitor::new(gateway.clone(), upstream.clone());
        let pool = gateway.pools().get("orders").unwrap().pool();

        upstream.fail_probe(&format!("{ORDERS_1}/health"));

        monitor.check_once().await;
        assert_eq!(pool.is_healthy(ORDERS_1), Some(true));

        let results = monitor.check_once().await;
        assert_eq!(results.len(), 2);
        assert_eq!(pool.is_healthy(ORDERS_1), Some(false));
        assert_eq!(upstream.probe_count(), 4);

        for _ in 0..3 {
            let response = router.handle_request(get("/orders"), None).await;
            assert_eq!(json_body(response).await["instance"], ORDERS_2);
        }

        upstream.recover_probe(&format!("{ORDERS_1}/health"));
        monitor.check_once().await;
        assert_eq!(pool.is_healthy(ORDERS_1), Some(true));
    }
}
