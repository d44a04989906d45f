use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward a request whose URI already points at the chosen instance
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send to the backend
    /// * `timeout` - Upper bound for receiving the response head
    ///
    /// # Returns
    /// The backend's response, or a connection / timeout error. Any status
    /// code the backend returns, 5xx included, is a successful transport.
    async fn forward(
        &self,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>>;

    /// Probe a health endpoint
    ///
    /// # Returns
    /// `true` only for a 2xx answer within `timeout`; errors and timeouts are `false`
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}
