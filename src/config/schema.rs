//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::duration;

/// Upstream address used when neither flag, environment nor file sets one.
pub const DEFAULT_VAULT_ADDRESS: &str = "https://127.0.0.1:8200";

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Upstream server connection settings.
    pub vault: VaultConfig,

    /// Automatic authentication and token sinks.
    pub auto_auth: Option<AutoAuthConfig>,

    /// Forwarding behaviour of the API proxy.
    pub api_proxy: Option<ApiProxyConfig>,

    /// Lease cache settings. Absent means requests are forwarded uncached.
    pub cache: Option<CacheConfig>,

    /// Listeners serving the local API.
    pub listeners: Vec<ListenerConfig>,

    /// Stop once the first token reached every sink.
    pub exit_after_auth: bool,

    /// Where to write the process ID once serving.
    pub pid_file: Option<PathBuf>,

    /// One of trace, debug, info, warn, error.
    pub log_level: Option<String>,

    /// `standard` or `json`.
    pub log_format: Option<String>,
}

impl Config {
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn log_format(&self) -> &str {
        self.log_format.as_deref().unwrap_or("standard")
    }

    /// Merge `other` on top of `self`.
    ///
    /// Values set in `other` win; listeners and sinks accumulate.
    pub fn merge(mut self, other: Config) -> Config {
        self.vault = self.vault.merge(other.vault);
        self.auto_auth = match (self.auto_auth.take(), other.auto_auth) {
            (Some(mut base), Some(mut next)) => {
                base.sinks.append(&mut next.sinks);
                next.sinks = base.sinks;
                Some(next)
            }
            (base, next) => next.or(base),
        };
        self.api_proxy = other.api_proxy.or(self.api_proxy);
        self.cache = other.cache.or(self.cache);
        self.listeners.extend(other.listeners);
        self.exit_after_auth |= other.exit_after_auth;
        self.pid_file = other.pid_file.or(self.pid_file);
        self.log_level = other.log_level.or(self.log_level);
        self.log_format = other.log_format.or(self.log_format);
        self
    }

    /// Whether the proxy should forward with the auto-auth token.
    pub fn use_auto_auth_token(&self) -> bool {
        self.api_proxy
            .as_ref()
            .is_some_and(|p| p.use_auto_auth_token.enabled())
    }
}

/// Upstream server connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    /// Base address, e.g. `https://vault.internal:8200`.
    pub address: String,
    pub ca_cert: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub tls_skip_verify: bool,
    /// Namespace applied to auth requests and, optionally, proxied requests.
    pub namespace: Option<String>,
    pub retry: RetryConfig,
}

impl VaultConfig {
    fn merge(self, other: VaultConfig) -> VaultConfig {
        VaultConfig {
            address: if other.address.is_empty() {
                self.address
            } else {
                other.address
            },
            ca_cert: other.ca_cert.or(self.ca_cert),
            ca_path: other.ca_path.or(self.ca_path),
            client_cert: other.client_cert.or(self.client_cert),
            client_key: other.client_key.or(self.client_key),
            tls_skip_verify: self.tls_skip_verify || other.tls_skip_verify,
            namespace: other.namespace.or(self.namespace),
            retry: if other.retry == RetryConfig::default() {
                self.retry
            } else {
                other.retry
            },
        }
    }
}

/// Upstream retry policy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of retries. 0 selects the default, -1 disables retries.
    pub num_retries: i32,
}

impl RetryConfig {
    pub const DEFAULT_RETRIES: u32 = 12;

    /// Effective retry count.
    pub fn max_retries(&self) -> u32 {
        match self.num_retries {
            0 => Self::DEFAULT_RETRIES,
            n if n < 0 => 0,
            n => n as u32,
        }
    }
}

/// Automatic authentication settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AutoAuthConfig {
    pub method: MethodConfig,

    #[serde(default)]
    pub sinks: Vec<SinkConfig>,

    /// Re-authenticate as soon as the method reports new credentials.
    #[serde(default)]
    pub enable_reauth_on_new_credentials: bool,
}

/// Authentication method settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MethodConfig {
    /// `token_file` or `approle`.
    #[serde(rename = "type")]
    pub method_type: String,

    /// Mount path of the method; defaults to `auth/<type>`.
    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default, with = "duration::option")]
    pub wrap_ttl: Option<Duration>,

    #[serde(default = "default_min_backoff", with = "duration")]
    pub min_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "duration")]
    pub max_backoff: Duration,

    /// Treat authentication failures as fatal instead of retrying.
    #[serde(default)]
    pub exit_on_error: bool,

    /// Method specific settings.
    #[serde(default)]
    pub config: toml::Table,
}

impl MethodConfig {
    pub fn new(method_type: impl Into<String>) -> Self {
        Self {
            method_type: method_type.into(),
            mount_path: None,
            namespace: None,
            wrap_ttl: None,
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            exit_on_error: false,
            config: toml::Table::new(),
        }
    }

    pub fn mount_path(&self) -> String {
        match &self.mount_path {
            Some(path) => path.trim_matches('/').to_string(),
            None => format!("auth/{}", self.method_type),
        }
    }

    /// Look up a string in the method's `config` table.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

fn default_min_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

/// Token sink settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SinkConfig {
    /// Only `file` is supported.
    #[serde(rename = "type")]
    pub sink_type: String,

    #[serde(default, with = "duration::option")]
    pub wrap_ttl: Option<Duration>,

    #[serde(default)]
    pub dh_type: Option<String>,

    #[serde(default)]
    pub dh_path: Option<PathBuf>,

    #[serde(default)]
    pub derive_key: bool,

    #[serde(default)]
    pub aad: Option<String>,

    /// Sink specific settings (`path`, `mode`, `remove_on_exit`).
    #[serde(default)]
    pub config: toml::Table,
}

impl SinkConfig {
    /// A file sink writing to `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let mut config = toml::Table::new();
        config.insert(
            "path".to_string(),
            toml::Value::String(path.into().to_string_lossy().into_owned()),
        );
        Self {
            sink_type: "file".to_string(),
            wrap_ttl: None,
            dh_type: None,
            dh_path: None,
            derive_key: false,
            aad: None,
            config,
        }
    }
}

/// API proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ApiProxyConfig {
    /// `never` (default) or `always`.
    pub enforce_consistency: String,

    /// `fail` (default), `retry` or `forward`.
    pub when_inconsistent: String,

    pub use_auto_auth_token: UseAutoAuthToken,

    pub prepend_configured_namespace: bool,
}

/// `use_auto_auth_token` accepts a boolean or the string `"force"`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum UseAutoAuthToken {
    Flag(bool),
    Mode(String),
}

impl Default for UseAutoAuthToken {
    fn default() -> Self {
        UseAutoAuthToken::Flag(false)
    }
}

impl UseAutoAuthToken {
    /// Resolve to `(use_auto_auth_token, force)`.
    pub fn resolve(&self) -> Result<(bool, bool), String> {
        match self {
            UseAutoAuthToken::Flag(flag) => Ok((*flag, false)),
            UseAutoAuthToken::Mode(mode) => match mode.to_ascii_lowercase().as_str() {
                "force" => Ok((true, true)),
                "true" => Ok((true, false)),
                "false" | "" => Ok((false, false)),
                other => Err(format!(
                    "value of 'use_auto_auth_token' can be either true/false/force, {:?} is invalid",
                    other
                )),
            },
        }
    }

    pub fn enabled(&self) -> bool {
        self.resolve().map(|(enabled, _)| enabled).unwrap_or(false)
    }

    pub fn forced(&self) -> bool {
        self.resolve().map(|(_, force)| force).unwrap_or(false)
    }
}

/// Lease cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_static_secrets: bool,
    pub disable_caching_dynamic_secrets: bool,
    pub persist: Option<PersistConfig>,
    #[serde(with = "duration")]
    pub static_secret_token_capability_refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_static_secrets: false,
            disable_caching_dynamic_secrets: false,
            persist: None,
            static_secret_token_capability_refresh_interval: Duration::from_secs(300),
        }
    }
}

/// Persistent cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PersistConfig {
    #[serde(rename = "type", default = "default_persist_type")]
    pub persist_type: String,

    /// Directory holding the snapshot file.
    pub path: PathBuf,

    #[serde(default)]
    pub keep_after_import: bool,

    /// Abort startup when the snapshot cannot be restored.
    #[serde(default)]
    pub exit_on_err: bool,
}

fn default_persist_type() -> String {
    "file".to_string()
}

/// Listener transport.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenerType {
    Tcp,
    Unix,
    /// In-memory pipe, used to embed the proxy and in tests.
    #[serde(alias = "bufconn")]
    InProcess,
}

impl fmt::Display for ListenerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerType::Tcp => f.write_str("tcp"),
            ListenerType::Unix => f.write_str("unix"),
            ListenerType::InProcess => f.write_str("in_process"),
        }
    }
}

/// What a listener serves.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerRole {
    #[default]
    Default,
    MetricsOnly,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ListenerConfig {
    #[serde(rename = "type")]
    pub listener_type: ListenerType,

    /// `host:port` for tcp, a socket path for unix.
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub tls_disable: bool,

    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    #[serde(default)]
    pub role: ListenerRole,

    /// Reject proxied requests lacking `X-Vault-Request: true`.
    #[serde(default)]
    pub require_request_header: bool,

    #[serde(default)]
    pub proxy_api: Option<ProxyApiConfig>,
}

impl ListenerConfig {
    /// A plain TCP listener.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            listener_type: ListenerType::Tcp,
            address: address.into(),
            tls_disable: true,
            tls_cert_file: None,
            tls_key_file: None,
            role: ListenerRole::Default,
            require_request_header: false,
            proxy_api: None,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.listener_type == ListenerType::Tcp && !self.tls_disable
    }

    pub fn quit_enabled(&self) -> bool {
        self.proxy_api.as_ref().is_some_and(|p| p.enable_quit)
    }
}

/// Proxy management API settings per listener.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyApiConfig {
    pub enable_quit: bool,
}
