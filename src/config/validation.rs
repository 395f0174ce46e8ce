//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check the bind target and path prefixes are well formed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RuntimeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::RuntimeConfig;
use crate::net::listener::BindTarget;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &RuntimeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.service.name.trim().is_empty() {
        errors.push(ValidationError::new("service.name", "must not be empty"));
    }

    if let Err(e) = config.listener.address.parse::<BindTarget>() {
        errors.push(ValidationError::new("listener.address", e.to_string()));
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than zero",
        ));
    }

    if config.listener.demux.read_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "listener.demux.read_timeout_ms",
            "must be greater than zero",
        ));
    }

    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new(
                "listener.tls",
                "cert_path and key_path must both be set",
            ));
        }
    }

    if config.shutdown.drain_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "shutdown.drain_timeout_ms",
            "must be greater than zero",
        ));
    }

    if config.registration.max_attempts == 0 {
        errors.push(ValidationError::new(
            "registration.max_attempts",
            "must be at least 1",
        ));
    }

    if config.registration.base_delay_ms > config.registration.max_delay_ms {
        errors.push(ValidationError::new(
            "registration.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }

    check_prefix(&config.gateway.prefix, "gateway.prefix", &mut errors);
    check_prefix(&config.web.prefix, "web.prefix", &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_prefix(prefix: &str, field: &'static str, errors: &mut Vec<ValidationError>) {
    if prefix.is_empty() {
        return;
    }
    if !prefix.starts_with('/') {
        errors.push(ValidationError::new(field, "must start with '/'"));
    } else if prefix.len() > 1 && prefix.ends_with('/') {
        errors.push(ValidationError::new(field, "must not end with '/'"));
    } else if prefix == "/" {
        errors.push(ValidationError::new(field, "use an empty prefix for the root"));
    }
}
