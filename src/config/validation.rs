use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{
    CacheConfig, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, RouteConfig,
    ServiceConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route '{prefix}' references unknown service '{service}'")]
    UnknownService { prefix: String, service: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem found
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }
        for (name, service) in &config.services {
            errors.extend(Self::validate_service(name, service));
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }
        for (prefix, route) in &config.routes {
            errors.extend(Self::validate_route(prefix, route, config));
        }

        errors.extend(Self::validate_health_check_config(&config.health_check));
        errors.extend(Self::validate_breaker_config(
            "circuit_breaker",
            &config.circuit_breaker,
        ));
        errors.extend(Self::validate_cache_config(&config.cache));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &ServiceConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if service.instances.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{name}' instances"),
                message: "A service must have at least one instance".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for (i, instance) in service.instances.iter().enumerate() {
            let context = format!("service '{name}' instance {}", i + 1);
            if let Err(e) = Self::validate_url(&instance.url, &context) {
                errors.push(e);
            }
            if !seen.insert(instance.url.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: context.clone(),
                    message: format!("Duplicate instance url '{}'", instance.url),
                });
            }
            if instance.weight == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} weight"),
                    message: "Weight must be at least 1".to_string(),
                });
            }
            if let Some(path) = &instance.health_path {
                if !path.starts_with('/') {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{context} health_path"),
                        message: "Must start with '/'".to_string(),
                    });
                }
            }
        }

        if let Some(breaker) = &service.circuit_breaker {
            errors.extend(Self::validate_breaker_config(
                &format!("service '{name}' circuit_breaker"),
                breaker,
            ));
        }

        errors
    }

    fn validate_route(
        prefix: &str,
        route: &RouteConfig,
        config: &GatewayConfig,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route path: {prefix}"),
                message: "Route paths must start with '/'".to_string(),
            });
        }

        if !config.services.contains_key(&route.service) {
            errors.push(ValidationError::UnknownService {
                prefix: prefix.to_string(),
                service: route.service.clone(),
            });
        }

        if route.timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{prefix}' timeout_ms"),
                message: "Must be greater than 0".to_string(),
            });
        }

        if route.cache_ttl_ms == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{prefix}' cache_ttl_ms"),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Some(rewrite) = &route.path_rewrite {
            if let Err(e) = Self::validate_path_rewrite(prefix, rewrite) {
                errors.push(e);
            }
        }

        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate path rewrite configuration
    fn validate_path_rewrite(path: &str, rewrite: &str) -> ValidationResult<()> {
        if rewrite.is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("route '{path}' path_rewrite"),
                message: "Path rewrite cannot be empty".to_string(),
            });
        }

        if !rewrite.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field: format!("route '{path}' path_rewrite"),
                message: "Path rewrite must start with '/'".to_string(),
            });
        }

        Ok(())
    }

    fn validate_health_check_config(config: &HealthCheckConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.enabled {
            return errors;
        }

        let positive = [
            ("health_check.interval_ms", config.interval_ms),
            ("health_check.timeout_ms", config.timeout_ms),
            (
                "health_check.unhealthy_threshold",
                u64::from(config.unhealthy_threshold),
            ),
            (
                "health_check.healthy_threshold",
                u64::from(config.healthy_threshold),
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0 when health checks are enabled".to_string(),
                });
            }
        }

        if config.path.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Cannot be empty when health checks are enabled".to_string(),
            });
        } else if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Must start with '/' when health checks are enabled".to_string(),
            });
        }

        errors
    }

    fn validate_breaker_config(scope: &str, config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{scope}.failure_threshold"),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.half_open_trial_count == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{scope}.half_open_trial_count"),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_cache_config(config: &CacheConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.enabled {
            return errors;
        }
        if config.max_entries == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.max_entries".to_string(),
                message: "Must be greater than 0 when the cache is enabled".to_string(),
            });
        }
        if config.default_ttl_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.default_ttl_ms".to_string(),
                message: "Must be greater than 0 when the cache is enabled".to_string(),
            });
        }
        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
