use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Reasons a request could not be routed to an upstream instance.
///
/// The `Display` output is safe to return to clients; internal details are
/// logged where the error is produced and never stored here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No route matches path '{path}'")]
    RouteNotFound { path: String },

    #[error("Method {method} is not allowed on this route")]
    MethodNotAllowed { service: String, method: String },

    #[error("Service '{service}' is temporarily unavailable (circuit open)")]
    CircuitOpen { service: String },

    #[error("Service '{service}' has no healthy instances")]
    NoHealthyInstance { service: String },

    #[error("Service '{service}' did not respond in time")]
    UpstreamTimeout { service: String },

    #[error("Service '{service}' could not be reached")]
    UpstreamConnection { service: String },

    #[error("Internal gateway error")]
    Internal { service: Option<String> },
}

/// JSON error body returned to clients.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
}

impl RoutingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoutingError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            RoutingError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            RoutingError::CircuitOpen { .. }
            | RoutingError::NoHealthyInstance { .. }
            | RoutingError::UpstreamTimeout { .. }
            | RoutingError::UpstreamConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RoutingError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable tag.
    pub fn tag(&self) -> &'static str {
        match self {
            RoutingError::RouteNotFound { .. } => "route-not-found",
            RoutingError::MethodNotAllowed { .. } => "method-not-allowed",
            RoutingError::CircuitOpen { .. } => "circuit-open",
            RoutingError::NoHealthyInstance { .. } => "no-healthy-instance",
            RoutingError::UpstreamTimeout { .. } => "upstream-timeout",
            RoutingError::UpstreamConnection { .. } => "upstream-connection-error",
            RoutingError::Internal { .. } => "internal-error",
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            RoutingError::RouteNotFound { .. } => None,
            RoutingError::MethodNotAllowed { service, .. }
            | RoutingError::CircuitOpen { service }
            | RoutingError::NoHealthyInstance { service }
            | RoutingError::UpstreamTimeout { service }
            | RoutingError::UpstreamConnection { service } => Some(service),
            RoutingError::Internal { service } => service.as_deref(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.tag(),
            service: self.service().map(str::to_string),
            message: self.to_string(),
        }
    }
}
