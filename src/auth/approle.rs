//! `approle` method: logs in with a role ID and secret ID read from files.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::auth::{AuthError, AuthMethod, AuthResponse};
use crate::config::MethodConfig;
use crate::proxy::UpstreamClient;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

pub struct AppRoleMethod {
    client: UpstreamClient,
    mount_path: String,
    role_id_file: PathBuf,
    secret_id_file: Option<PathBuf>,
    remove_secret_id_file: bool,
    /// Secret ID read earlier, reused once its file has been removed.
    cached_secret_id: Mutex<Option<String>>,
}

impl AppRoleMethod {
    pub fn from_config(config: &MethodConfig, client: UpstreamClient) -> Result<Self, AuthError> {
        let role_id_file = config
            .config_str("role_id_file_path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AuthError::InvalidConfig("'role_id_file_path' must be specified".into()))?;
        let secret_id_file = config
            .config_str("secret_id_file_path")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let remove_secret_id_file = config
            .config
            .get("remove_secret_id_file_after_reading")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        Ok(Self {
            client,
            mount_path: config.mount_path(),
            role_id_file: PathBuf::from(role_id_file),
            secret_id_file,
            remove_secret_id_file,
            cached_secret_id: Mutex::new(None),
        })
    }

    async fn read_secret_id(&self) -> Result<String, AuthError> {
        let Some(path) = &self.secret_id_file else {
            return Ok(String::new());
        };

        match read_trimmed(path).await {
            Ok(secret_id) => {
                if self.remove_secret_id_file {
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove secret ID file");
                    }
                }
                if let Ok(mut cached) = self.cached_secret_id.lock() {
                    *cached = Some(secret_id.clone());
                }
                Ok(secret_id)
            }
            Err(AuthError::Credentials { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                let cached = self
                    .cached_secret_id
                    .lock()
                    .ok()
                    .and_then(|cached| cached.clone());
                cached.ok_or_else(|| AuthError::Credentials {
                    path: path.clone(),
                    source,
                })
            }
            Err(e) => Err(e),
        }
    }
}

async fn read_trimmed(path: &Path) -> Result<String, AuthError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AuthError::Credentials {
            path: path.to_path_buf(),
            source,
        })?;
    let value = content.trim();
    if value.is_empty() {
        return Err(AuthError::EmptyCredential(path.to_path_buf()));
    }
    Ok(value.to_string())
}

#[async_trait]
impl AuthMethod for AppRoleMethod {
    fn name(&self) -> &str {
        "approle"
    }

    async fn authenticate(&self) -> Result<AuthResponse, AuthError> {
        let role_id = read_trimmed(&self.role_id_file).await?;
        let secret_id = self.read_secret_id().await?;

        let path = format!("/v1/{}/login", self.mount_path);
        let response = self
            .client
            .request(Method::POST, &path, None)?
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let login: LoginResponse = response.json().await?;
        let auth = login.auth.ok_or(AuthError::MissingAuth)?;
        if auth.client_token.is_empty() {
            return Err(AuthError::MissingAuth);
        }

        Ok(AuthResponse {
            token: auth.client_token,
            lease_duration: Duration::from_secs(auth.lease_duration),
            renewable: auth.renewable,
        })
    }
}
