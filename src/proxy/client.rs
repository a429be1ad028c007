//! HTTP client for the upstream server.

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Certificate, Identity, Method, RequestBuilder};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::config::VaultConfig;

/// User agent sent on every upstream request.
pub const USER_AGENT: &str = concat!("vault-proxy/", env!("CARGO_PKG_VERSION"));

pub const HEADER_TOKEN: &str = "x-vault-token";
pub const HEADER_NAMESPACE: &str = "x-vault-namespace";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid upstream address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid certificate material in {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    #[error("invalid header value for {0}")]
    Header(&'static str),

    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Shared, cheaply cloneable client bound to one upstream address.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    address: Url,
    namespace: Option<String>,
    max_retries: u32,
}

impl UpstreamClient {
    pub fn from_config(config: &VaultConfig) -> Result<Self, ClientError> {
        let address = Url::parse(&config.address).map_err(|source| ClientError::InvalidAddress {
            address: config.address.clone(),
            source,
        })?;

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(config.tls_skip_verify);

        if let Some(path) = &config.ca_cert {
            for cert in read_certificates(path)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let Some(dir) = &config.ca_path {
            let entries = fs::read_dir(dir).map_err(|source| ClientError::Read {
                path: dir.clone(),
                source,
            })?;
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            paths.sort();
            for path in paths.iter().filter(|p| p.is_file()) {
                for cert in read_certificates(path)? {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }
        if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
            builder = builder.identity(read_identity(cert, key)?);
        }

        Ok(Self {
            http: builder.build()?,
            address,
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
            max_retries: config.retry.max_retries(),
        })
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Same connection pool, different namespace.
    pub fn with_namespace(&self, namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            ..self.clone()
        }
    }

    /// Absolute URL for a path such as `/v1/sys/health?standbyok=true`.
    pub fn url(&self, path_and_query: &str) -> Result<Url, ClientError> {
        self.address
            .join(path_and_query)
            .map_err(|source| ClientError::InvalidAddress {
                address: format!("{}{}", self.address, path_and_query),
                source,
            })
    }

    /// Request builder carrying the token and configured namespace.
    pub fn request(
        &self,
        method: Method,
        path_and_query: &str,
        token: Option<&str>,
    ) -> Result<RequestBuilder, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            headers.insert(
                HEADER_TOKEN,
                HeaderValue::from_str(token).map_err(|_| ClientError::Header(HEADER_TOKEN))?,
            );
        }
        if let Some(namespace) = &self.namespace {
            headers.insert(
                HEADER_NAMESPACE,
                HeaderValue::from_str(namespace).map_err(|_| ClientError::Header(HEADER_NAMESPACE))?,
            );
        }
        Ok(self
            .http
            .request(method, self.url(path_and_query)?)
            .headers(headers))
    }

    /// Raw request builder for forwarding; headers are the caller's business.
    pub fn forward(&self, method: Method, path_and_query: &str) -> Result<RequestBuilder, ClientError> {
        Ok(self.http.request(method, self.url(path_and_query)?))
    }
}

fn read_certificates(path: &Path) -> Result<Vec<Certificate>, ClientError> {
    let file = fs::File::open(path).map_err(|source| ClientError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut certs = Vec::new();
    for der in rustls_pemfile::certs(&mut reader) {
        let der = der.map_err(|e| ClientError::Certificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let cert = Certificate::from_der(der.as_ref()).map_err(|e| ClientError::Certificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        certs.push(cert);
    }
    if certs.is_empty() {
        return Err(ClientError::Certificate {
            path: path.to_path_buf(),
            reason: "no PEM certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn read_identity(cert: &Path, key: &Path) -> Result<Identity, ClientError> {
    let mut pem = fs::read(cert).map_err(|source| ClientError::Read {
        path: cert.to_path_buf(),
        source,
    })?;
    pem.push(b'\n');
    pem.extend(fs::read(key).map_err(|source| ClientError::Read {
        path: key.to_path_buf(),
        source,
    })?);
    Identity::from_pem(&pem).map_err(|e| ClientError::Certificate {
        path: cert.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(address: &str) -> VaultConfig {
        VaultConfig {
            address: address.to_string(),
            namespace: Some("team-a".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_joins_paths() {
        let client = UpstreamClient::from_config(&config("http://127.0.0.1:8200")).unwrap();
        let url = client.url("/v1/secret/data/foo?version=2").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8200/v1/secret/data/foo?version=2");
        assert_eq!(client.max_retries(), 12);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = UpstreamClient::from_config(&config("not a url")).unwrap_err();
        assert!(matches!(err, ClientError::InvalidAddress { .. }));
    }

    #[test]
    fn test_request_sets_namespace_and_token() {
        let client = UpstreamClient::from_config(&config("http://127.0.0.1:8200")).unwrap();
        let request = client
            .request(Method::GET, "/v1/auth/token/lookup-self", Some("s.abc"))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers()[HEADER_TOKEN], "s.abc");
        assert_eq!(request.headers()[HEADER_NAMESPACE], "team-a");

        let root = client.with_namespace(None);
        let request = root.request(Method::GET, "/v1/sys/health", None).unwrap().build().unwrap();
        assert!(request.headers().get(HEADER_NAMESPACE).is_none());
        assert!(request.headers().get(HEADER_TOKEN).is_none());
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let mut cfg = config("https://127.0.0.1:8200");
        cfg.ca_cert = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(matches!(
            UpstreamClient::from_config(&cfg),
            Err(ClientError::Read { .. })
        ));
    }
}
