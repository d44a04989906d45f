pub mod admin;
pub mod health_monitor;
pub mod http_client;
pub mod router;

/// Re-export commonly used types from adapters
pub use health_monitor::HealthMonitor;
pub use http_client::HttpClientAdapter;
pub use router::GatewayRouter;
