//! `token_file` method: the token is read from a file on every login.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{AuthError, AuthMethod, AuthResponse};
use crate::config::MethodConfig;

pub struct TokenFileMethod {
    path: PathBuf,
}

impl TokenFileMethod {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &MethodConfig) -> Result<Self, AuthError> {
        let path = config
            .config_str("token_file_path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AuthError::InvalidConfig("'token_file_path' must be specified".into()))?;
        Ok(Self::new(path))
    }
}

#[async_trait]
impl AuthMethod for TokenFileMethod {
    fn name(&self) -> &str {
        "token_file"
    }

    async fn authenticate(&self) -> Result<AuthResponse, AuthError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AuthError::Credentials {
                path: self.path.clone(),
                source,
            })?;
        let token = content.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyCredential(self.path.clone()));
        }
        Ok(AuthResponse {
            token: token.to_string(),
            lease_duration: Duration::ZERO,
            renewable: false,
        })
    }
}
