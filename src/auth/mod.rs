//! Automatic authentication.
//!
//! # Data Flow
//! ```text
//! AuthMethod::authenticate (token_file.rs / approle.rs)
//!     → handler.rs (AuthHandler: backoff on failure, re-auth schedule)
//!     → TokenEvent on the output channel
//!     → SinkServer
//! ```
//!
//! # Design Decisions
//! - Methods only know how to log in; scheduling and retries live in the handler
//! - Re-authentication happens at two thirds of the token TTL, or earlier when a
//!   method reports new credentials and the config allows it
//! - `exit_on_error` turns any failed login into a fatal actor error

pub mod approle;
pub mod handler;
pub mod token_file;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::MethodConfig;
use crate::proxy::{ClientError, UpstreamClient};

pub use approle::AppRoleMethod;
pub use handler::{AuthHandler, AuthHandlerConfig, TokenEvent};
pub use token_file::TokenFileMethod;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown auth method {0:?}")]
    UnknownMethod(String),

    #[error("invalid auth method config: {0}")]
    InvalidConfig(String),

    #[error("failed to read {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is empty")]
    EmptyCredential(PathBuf),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("login request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("login rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("login response did not contain auth data")]
    MissingAuth,
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub token: String,
    /// Zero when the TTL is unknown.
    pub lease_duration: Duration,
    pub renewable: bool,
}

/// A way of obtaining a token.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    fn name(&self) -> &str;

    async fn authenticate(&self) -> Result<AuthResponse, AuthError>;

    /// Signalled when the method's credentials changed.
    fn new_credentials(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Build the configured method.
pub fn build_method(
    config: &MethodConfig,
    client: &UpstreamClient,
) -> Result<Arc<dyn AuthMethod>, AuthError> {
    let client = match &config.namespace {
        Some(ns) => client.with_namespace(Some(ns.clone())),
        None => client.clone(),
    };
    match config.method_type.as_str() {
        "token_file" => Ok(Arc::new(TokenFileMethod::from_config(config)?)),
        "approle" => Ok(Arc::new(AppRoleMethod::from_config(config, client)?)),
        other => Err(AuthError::UnknownMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;

    #[test]
    fn test_unknown_method_rejected() {
        let client = UpstreamClient::from_config(&VaultConfig {
            address: "http://127.0.0.1:8200".into(),
            ..Default::default()
        })
        .unwrap();
        let result = build_method(&MethodConfig::new("kerberos"), &client);
        assert!(matches!(result, Err(AuthError::UnknownMethod(_))));
    }
}
