pub mod circuit_breaker;
pub mod error;
pub mod gateway;
pub mod instance_pool;
pub mod load_balancer;
pub mod response_cache;

pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use error::RoutingError;
pub use gateway::GatewayService;
pub use load_balancer::{EndpointLease, LoadBalancer, LoadBalancerError, PoolRegistry};
pub use response_cache::{CachedResponse, ResponseCache};
