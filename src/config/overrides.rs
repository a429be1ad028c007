//! Command line and environment overrides for the upstream connection.
//!
//! Precedence is flag, then environment variable (both resolved by clap),
//! then the value from the config file, then the built-in default.

use clap::builder::BoolishValueParser;
use clap::Args;
use std::path::PathBuf;

use crate::config::schema::{VaultConfig, DEFAULT_VAULT_ADDRESS};

/// Upstream connection settings that may come from flags or the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct VaultOverrides {
    /// Address of the upstream server.
    #[arg(long = "address", env = "VAULT_ADDR")]
    pub address: Option<String>,

    /// PEM encoded CA certificate used to verify the upstream server.
    #[arg(long = "ca-cert", env = "VAULT_CACERT")]
    pub ca_cert: Option<PathBuf>,

    /// Directory of PEM encoded CA certificates.
    #[arg(long = "ca-path", env = "VAULT_CAPATH")]
    pub ca_path: Option<PathBuf>,

    /// PEM encoded client certificate for TLS authentication upstream.
    #[arg(long = "client-cert", env = "VAULT_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// PEM encoded private key matching the client certificate.
    #[arg(long = "client-key", env = "VAULT_CLIENT_KEY")]
    pub client_key: Option<PathBuf>,

    /// Disable verification of the upstream certificate.
    #[arg(
        long = "tls-skip-verify",
        env = "VAULT_SKIP_VERIFY",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub tls_skip_verify: Option<bool>,
}

impl VaultOverrides {
    /// Apply overrides to the loaded config and fill in the default address.
    pub fn apply(&self, vault: &mut VaultConfig) {
        if let Some(address) = &self.address {
            vault.address = address.clone();
        }
        if vault.address.is_empty() {
            vault.address = DEFAULT_VAULT_ADDRESS.to_string();
        }
        if let Some(path) = &self.ca_cert {
            vault.ca_cert = Some(path.clone());
        }
        if let Some(path) = &self.ca_path {
            vault.ca_path = Some(path.clone());
        }
        if let Some(path) = &self.client_cert {
            vault.client_cert = Some(path.clone());
        }
        if let Some(path) = &self.client_key {
            vault.client_key = Some(path.clone());
        }
        if let Some(skip) = self.tls_skip_verify {
            vault.tls_skip_verify = skip;
        }
    }
}
