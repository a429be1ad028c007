//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check cross-block requirements (cache needs a listener, auto-auth needs a sink)
//! - Validate listener transports and TLS material
//! - Reject policy strings the proxy does not understand
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{Config, ListenerConfig, ListenerType};
use crate::proxy::consistency::ConsistencyPolicy;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a merged configuration.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.auto_auth.is_none() && config.cache.is_none() && config.listeners.is_empty() {
        errors.push(ValidationError::new(
            "config",
            "no auto_auth, cache, or listener block found in config",
        ));
    }

    if config.cache.is_some() && config.listeners.is_empty() {
        errors.push(ValidationError::new("cache", "enabling the cache requires at least 1 listener"));
    }
    if config.api_proxy.is_some() && config.listeners.is_empty() {
        errors.push(ValidationError::new(
            "api_proxy",
            "configuring the api_proxy requires at least 1 listener",
        ));
    }

    if let Some(api_proxy) = &config.api_proxy {
        if let Err(e) = api_proxy.use_auto_auth_token.resolve() {
            errors.push(ValidationError::new("api_proxy.use_auto_auth_token", e));
        }
        if let Err(e) = ConsistencyPolicy::from_config(Some(api_proxy)) {
            errors.push(ValidationError::new("api_proxy", e.to_string()));
        }
    }

    let use_auto_auth_token = config.use_auto_auth_token();
    match &config.auto_auth {
        Some(auto_auth) => {
            let method = &auto_auth.method;
            if use_auto_auth_token && method.wrap_ttl.is_some() {
                errors.push(ValidationError::new(
                    "auto_auth.method.wrap_ttl",
                    "response wrapping cannot be used with use_auto_auth_token",
                ));
            }
            if auto_auth.sinks.is_empty() && !use_auto_auth_token {
                errors.push(ValidationError::new(
                    "auto_auth",
                    "auto_auth requires at least one sink or api_proxy.use_auto_auth_token",
                ));
            }
            if method.min_backoff > method.max_backoff {
                errors.push(ValidationError::new(
                    "auto_auth.method",
                    "min_backoff cannot be greater than max_backoff",
                ));
            }
            if !matches!(method.method_type.as_str(), "token_file" | "approle") {
                errors.push(ValidationError::new(
                    "auto_auth.method.type",
                    format!("unknown auth method {:?}", method.method_type),
                ));
            }
            for (i, sink) in auto_auth.sinks.iter().enumerate() {
                let field = format!("auto_auth.sinks[{}]", i);
                if sink.sink_type != "file" {
                    errors.push(ValidationError::new(
                        &field,
                        format!("unknown sink type {:?}", sink.sink_type),
                    ));
                }
                if sink.dh_type.is_some() || sink.wrap_ttl.is_some() {
                    errors.push(ValidationError::new(
                        &field,
                        "sink response wrapping and encryption are not supported",
                    ));
                }
                if sink.config.get("path").and_then(|p| p.as_str()).is_none() {
                    errors.push(ValidationError::new(&field, "'path' must be specified"));
                }
            }
        }
        None if use_auto_auth_token => {
            errors.push(ValidationError::new(
                "api_proxy.use_auto_auth_token",
                "use_auto_auth_token requires an auto_auth block",
            ));
        }
        None => {}
    }

    if let Some(persist) = config.cache.as_ref().and_then(|c| c.persist.as_ref()) {
        if persist.persist_type != "file" {
            errors.push(ValidationError::new(
                "cache.persist.type",
                format!("unsupported persistence type {:?}", persist.persist_type),
            ));
        }
        if persist.path.as_os_str().is_empty() {
            errors.push(ValidationError::new("cache.persist.path", "path must be specified"));
        }
    }

    for (i, listener) in config.listeners.iter().enumerate() {
        validate_listener(i, listener, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(index: usize, listener: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    let field = format!("listeners[{}]", index);
    match listener.listener_type {
        ListenerType::Tcp => {
            if listener.address.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::new(
                    &field,
                    format!("invalid tcp address {:?}", listener.address),
                ));
            }
            if listener.tls_enabled()
                && (listener.tls_cert_file.is_none() || listener.tls_key_file.is_none())
            {
                errors.push(ValidationError::new(
                    &field,
                    "tls_cert_file and tls_key_file are required unless tls_disable is set",
                ));
            }
        }
        ListenerType::Unix => {
            if listener.address.is_empty() {
                errors.push(ValidationError::new(&field, "unix listener requires a socket path"));
            }
            if listener.tls_cert_file.is_some() && !listener.tls_disable {
                errors.push(ValidationError::new(&field, "TLS is only supported on tcp listeners"));
            }
        }
        ListenerType::InProcess => {}
    }
}
