//! TLS material for listeners, with in-place reload.

use axum_server::tls_rustls::RustlsConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid PEM in {path}: {reason}")]
    Pem { path: PathBuf, reason: String },

    #[error("failed to build TLS configuration: {0}")]
    Load(#[source] std::io::Error),
}

/// Select the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Check both files parse before handing them to rustls.
fn validate_pair(cert: &Path, key: &Path) -> Result<(), TlsError> {
    let mut reader = open(cert)?;
    let mut found = false;
    for der in rustls_pemfile::certs(&mut reader) {
        der.map_err(|e| TlsError::Pem {
            path: cert.to_path_buf(),
            reason: e.to_string(),
        })?;
        found = true;
    }
    if !found {
        return Err(TlsError::NoCertificates(cert.to_path_buf()));
    }

    let mut reader = open(key)?;
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(TlsError::NoPrivateKey(key.to_path_buf())),
        Err(e) => Err(TlsError::Pem {
            path: key.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// A listener's certificate pair and the live rustls config built from it.
///
/// The config is shared with the TLS acceptor, so a successful reload is
/// visible to the next handshake. Existing connections keep their session.
pub struct TlsReloader {
    cert: PathBuf,
    key: PathBuf,
    config: RustlsConfig,
}

impl TlsReloader {
    pub async fn load(cert: &Path, key: &Path) -> Result<Self, TlsError> {
        validate_pair(cert, key)?;
        let config = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(TlsError::Load)?;
        Ok(Self {
            cert: cert.to_path_buf(),
            key: key.to_path_buf(),
            config,
        })
    }

    pub fn config(&self) -> RustlsConfig {
        self.config.clone()
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    /// Re-read the pair from disk. On failure the current config stays.
    pub async fn reload(&self) -> Result<(), TlsError> {
        let result = match validate_pair(&self.cert, &self.key) {
            Ok(()) => self
                .config
                .reload_from_pem_file(&self.cert, &self.key)
                .await
                .map_err(TlsError::Load),
            Err(e) => Err(e),
        };
        metrics::record_tls_reload(result.is_ok());
        match &result {
            Ok(()) => tracing::info!(cert = %self.cert.display(), "TLS certificate reloaded"),
            Err(e) => tracing::error!(cert = %self.cert.display(), error = %e, "TLS certificate reload failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_pair(&dir.path().join("cert.pem"), &dir.path().join("key.pem")).unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn test_empty_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        assert!(matches!(
            validate_pair(&cert, &key),
            Err(TlsError::NoCertificates(_))
        ));
    }

    #[tokio::test]
    async fn test_fixture_pair_loads_and_reloads() {
        install_crypto_provider();
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let reloader = TlsReloader::load(&fixtures.join("server.crt"), &fixtures.join("server.key"))
            .await
            .unwrap();
        reloader.reload().await.unwrap();
    }
}
