//! Switchyard - the routing and resilience layer of an edge gateway.
//!
//! Switchyard sits between inbound HTTP traffic and a fixed set of upstream
//! services. It implements a **hexagonal architecture**: routing decisions and
//! the shared state they depend on live in `core`, the transport is a port
//! (`ports::http_client::HttpClient`) with a hyper adapter, and the axum
//! surface lives in `adapters`.
//!
//! # Features
//! - Per-service instance pools with round-robin, random, least-connections
//!   and weighted selection over the healthy subset
//! - Active health probing with consecutive success / failure thresholds
//! - Passive health updates from proxied request outcomes
//! - Per-service circuit breakers (CLOSED / OPEN / HALF_OPEN)
//! - A TTL response cache with prefix invalidation and an LRU size bound
//! - Operational endpoints under `/gateway/`
//! - Structured tracing via `tracing` and graceful shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{GatewayRouter, GatewayService, HttpClientAdapter, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = load_config("config.toml").await?;
//! let gateway = Arc::new(GatewayService::new(Arc::new(cfg))?);
//! let app = GatewayRouter::new(gateway, Arc::new(HttpClientAdapter::new()?)).into_app();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Setup paths return `eyre::Result<T>` with `WrapErr` context. Component
//! errors are `thiserror` enums; routing failures are rendered as JSON bodies
//! and never expose upstream addresses.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`. Pool health is an `arc-swap` snapshot so
//! instance selection never waits on the writers.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{GatewayRouter, HealthMonitor, HttpClientAdapter},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
