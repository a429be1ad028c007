//! Lease-aware response cache sitting in front of the API proxy.
//!
//! Dynamic entries are renewable leases and auth responses obtained with a
//! token the proxy manages; they expire with their lease. Static entries are
//! KV reads keyed by namespace and path only, shared by every token that has
//! been seen reading them.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use crate::cache::persist::Persistence;
use crate::cache::CacheError;
use crate::config::CacheConfig;
use crate::observability::metrics;
use crate::proxy::{CacheMeta, Proxier, ProxyError, SendRequest, SendResponse};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn hash_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Key of a dynamic entry: the whole request, token included.
pub fn dynamic_index_id(request: &SendRequest) -> String {
    hash_hex(&[
        request.method.as_str().as_bytes(),
        request.path_and_query.as_bytes(),
        request.namespace().as_bytes(),
        request.token.as_deref().unwrap_or("").as_bytes(),
        &request.body,
    ])
}

/// Key of a static secret: namespace and path, independent of the token.
pub fn static_index_id(namespace: &str, request_path: &str) -> String {
    let path = request_path.trim_start_matches("/v1/").trim_matches('/');
    hash_hex(&[b"static-secret", namespace.as_bytes(), path.as_bytes()])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A renewable secret lease.
    Lease,
    /// A token created through the proxy.
    Token,
    /// The auto-auth token, registered by the in-memory sink.
    AutoAuthToken,
    /// A KV read shared across permitted tokens.
    StaticSecret,
}

/// Response body and headers as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CachedResponse {
    /// `None` for bodies that are not UTF-8.
    pub fn from_response(response: &SendResponse) -> Option<Self> {
        let body = String::from_utf8(response.body.to_vec()).ok()?;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Some(Self {
            status: response.status.as_u16(),
            headers,
            body,
        })
    }

    pub fn to_response(&self, cache_meta: CacheMeta) -> SendResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        SendResponse {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone().into(),
            cache_meta: Some(cache_meta),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub kind: EntryKind,
    pub namespace: String,
    pub request_path: String,
    /// The token this entry represents, for token entries.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_accessor: Option<String>,
    /// Token that made the request which produced this entry.
    #[serde(default)]
    pub request_token: Option<String>,
    #[serde(default)]
    pub lease: Option<String>,
    #[serde(default)]
    pub response: Option<CachedResponse>,
    /// Tokens permitted to read a static secret.
    #[serde(default)]
    pub allowed_tokens: BTreeSet<String>,
    pub cached_at: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl CacheEntry {
    pub fn new(
        id: impl Into<String>,
        kind: EntryKind,
        namespace: impl Into<String>,
        request_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            namespace: namespace.into(),
            request_path: request_path.into(),
            token: None,
            token_accessor: None,
            request_token: None,
            lease: None,
            response: None,
            allowed_tokens: BTreeSet::new(),
            cached_at: unix_now(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_token(&self) -> bool {
        matches!(self.kind, EntryKind::Token | EntryKind::AutoAuthToken)
    }
}

/// A static secret known to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticSecretRef {
    pub id: String,
    pub namespace: String,
    pub request_path: String,
}

/// Body of `/proxy/v1/cache-clear`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheClearRequest {
    #[serde(rename = "type", default)]
    pub clear_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct SecretResponse {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    mount_type: String,
    #[serde(default)]
    auth: Option<SecretAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretAuth {
    #[serde(default)]
    client_token: String,
    #[serde(default)]
    accessor: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    orphan: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseCacheConfig {
    pub cache_static_secrets: bool,
    pub cache_dynamic_secrets: bool,
    pub persistence: Option<Persistence>,
}

impl LeaseCacheConfig {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            cache_static_secrets: config.cache_static_secrets,
            cache_dynamic_secrets: !config.disable_caching_dynamic_secrets,
            persistence: config.persist.as_ref().map(Persistence::from_config),
        }
    }
}

pub struct LeaseCache {
    proxier: Arc<dyn Proxier>,
    entries: DashMap<String, CacheEntry>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    shutting_down: AtomicBool,
    cache_static_secrets: bool,
    cache_dynamic_secrets: bool,
    persistence: Option<Persistence>,
    capability_stop: Mutex<Option<CancellationToken>>,
}

impl LeaseCache {
    /// Create the cache. `base` is the orchestrator's context: when it is
    /// cancelled outside of shutdown, every entry is evicted.
    pub fn new(
        proxier: Arc<dyn Proxier>,
        config: LeaseCacheConfig,
        base: CancellationToken,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            proxier,
            entries: DashMap::new(),
            locks: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            cache_static_secrets: config.cache_static_secrets,
            cache_dynamic_secrets: config.cache_dynamic_secrets,
            persistence: config.persistence,
            capability_stop: Mutex::new(None),
        });
        tokio::spawn(watch_base_context(Arc::downgrade(&cache), base));
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn cache_static_secrets(&self) -> bool {
        self.cache_static_secrets
    }

    /// Mark the cache as shutting down so cancellation keeps its entries.
    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::SeqCst);
        if shutting_down {
            if let Ok(stop) = self.capability_stop.lock() {
                if let Some(stop) = stop.as_ref() {
                    stop.cancel();
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Remember how to stop the capability manager on shutdown.
    pub fn attach_capability_manager(&self, stop: CancellationToken) {
        if self.is_shutting_down() {
            stop.cancel();
        }
        if let Ok(mut slot) = self.capability_stop.lock() {
            *slot = Some(stop);
        }
    }

    /// Load the persisted snapshot. Returns how many entries were restored.
    pub fn restore(&self) -> Result<usize, CacheError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let now = unix_now();
        let mut restored = 0;
        for entry in persistence.load()? {
            if entry.is_expired(now) {
                continue;
            }
            self.entries.insert(entry.id.clone(), entry);
            restored += 1;
        }
        if !persistence.keep_after_import() {
            persistence.clear()?;
        }
        metrics::record_cache_size(self.entries.len());
        tracing::info!(entries = restored, path = %persistence.path().display(), "Restored cache from snapshot");
        Ok(restored)
    }

    /// Track the auto-auth token so requests made with it are cacheable.
    pub fn register_auto_auth_token(&self, token: &str) -> Result<(), CacheError> {
        if self.is_managed(token) {
            return Ok(());
        }
        let id = hash_hex(&[b"auto-auth-token", token.as_bytes()]);
        let mut entry = CacheEntry::new(id.clone(), EntryKind::AutoAuthToken, "root/", "");
        entry.token = Some(token.to_string());
        self.entries.insert(id, entry);
        metrics::record_cache_size(self.entries.len());
        if let Some(persistence) = &self.persistence {
            persistence.save(&self.snapshot())?;
        }
        Ok(())
    }

    pub fn is_managed(&self, token: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.is_token() && e.token.as_deref() == Some(token))
    }

    /// Handle a cache-clear request; returns how many entries were evicted.
    pub fn clear(&self, request: &CacheClearRequest) -> Result<usize, CacheError> {
        let evicted = match request.clear_type.as_str() {
            "" => return Err(CacheError::MissingClearType),
            "request_path" => {
                let namespace = normalize_namespace(&request.namespace);
                let prefix = request.value.as_str();
                self.evict_where(|e| e.namespace == namespace && e.request_path.starts_with(prefix))
            }
            "token" if request.value.is_empty() => 0,
            "token" => self.evict_token_tree(&request.value),
            "token_accessor" => {
                let token = self
                    .entries
                    .iter()
                    .find(|e| e.token_accessor.as_deref() == Some(request.value.as_str()))
                    .and_then(|e| e.token.clone());
                match token {
                    Some(token) => self.evict_token_tree(&token),
                    None => 0,
                }
            }
            "lease" => {
                let lease = request.value.as_str();
                self.evict_where(|e| e.lease.as_deref() == Some(lease))
            }
            "all" => {
                let count = self.entries.len();
                self.entries.clear();
                if let Some(persistence) = &self.persistence {
                    persistence.clear()?;
                }
                metrics::record_cache_size(0);
                count
            }
            other => return Err(CacheError::InvalidClearType(other.to_string())),
        };
        tracing::info!(clear_type = %request.clear_type, evicted, "Cache cleared");
        Ok(evicted)
    }

    /// Static secrets currently cached.
    pub fn static_entries(&self) -> Vec<StaticSecretRef> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::StaticSecret)
            .map(|e| StaticSecretRef {
                id: e.id.clone(),
                namespace: e.namespace.clone(),
                request_path: e.request_path.clone(),
            })
            .collect()
    }

    /// Tokens with static secret access, and what they can read.
    pub fn static_secret_tokens(&self) -> HashMap<String, Vec<StaticSecretRef>> {
        let mut tokens: HashMap<String, Vec<StaticSecretRef>> = HashMap::new();
        for entry in self.entries.iter().filter(|e| e.kind == EntryKind::StaticSecret) {
            for token in &entry.allowed_tokens {
                tokens.entry(token.clone()).or_default().push(StaticSecretRef {
                    id: entry.id.clone(),
                    namespace: entry.namespace.clone(),
                    request_path: entry.request_path.clone(),
                });
            }
        }
        tokens
    }

    /// Replace the body of a static secret, keeping who may read it.
    pub fn update_static_secret(&self, id: &str, response: CachedResponse) -> bool {
        let updated = match self.entries.get_mut(id) {
            Some(mut entry) if entry.kind == EntryKind::StaticSecret => {
                entry.response = Some(response);
                entry.cached_at = unix_now();
                true
            }
            _ => false,
        };
        if updated {
            self.persist();
        }
        updated
    }

    /// Drop one token's access to a static secret.
    pub fn revoke_static_access(&self, token: &str, id: &str) {
        let now_empty = match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.allowed_tokens.remove(token);
                entry.allowed_tokens.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.entries.remove(id);
        }
        self.persist();
        tracing::debug!(id, "Revoked static secret access for token");
    }

    pub fn evict(&self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    fn evict_where<F: Fn(&CacheEntry) -> bool>(&self, predicate: F) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        if !ids.is_empty() {
            self.persist();
        }
        ids.len()
    }

    /// Evict a token, everything it created, and the same for its children.
    fn evict_token_tree(&self, token: &str) -> usize {
        let mut queue = vec![token.to_string()];
        let mut evicted = 0;
        while let Some(current) = queue.pop() {
            let matches: Vec<(String, Option<String>)> = self
                .entries
                .iter()
                .filter(|e| {
                    e.request_token.as_deref() == Some(current.as_str())
                        || (e.is_token() && e.token.as_deref() == Some(current.as_str()))
                })
                .map(|e| {
                    let child = if e.kind == EntryKind::Token
                        && e.request_token.as_deref() == Some(current.as_str())
                    {
                        e.token.clone()
                    } else {
                        None
                    };
                    (e.key().clone(), child)
                })
                .collect();
            for (id, child) in matches {
                if self.entries.remove(&id).is_some() {
                    evicted += 1;
                }
                if let Some(child) = child {
                    queue.push(child);
                }
            }
        }
        if evicted > 0 {
            self.persist();
        }
        evicted
    }

    fn evict_expired(&self) {
        let now = unix_now();
        let evicted = self.evict_where(|e| e.is_expired(now));
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired cache entries");
        }
    }

    fn on_base_cancelled(&self) {
        if self.is_shutting_down() {
            tracing::info!(entries = self.entries.len(), "Cache shutting down, preserving entries");
            self.persist();
            return;
        }
        let count = self.entries.len();
        self.entries.clear();
        metrics::record_cache_size(0);
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.clear() {
                tracing::error!(error = %e, "Failed to clear persisted cache");
            }
        }
        tracing::info!(evicted = count, "Base context cancelled, evicted all cache entries");
    }

    fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    fn persist(&self) {
        metrics::record_cache_size(self.entries.len());
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(&self.snapshot()) {
                tracing::error!(error = %e, "Failed to persist cache snapshot");
            }
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn lookup(&self, id: &str, static_token: Option<&str>) -> Option<SendResponse> {
        let now = unix_now();
        let (expired, hit) = {
            let entry = self.entries.get(id)?;
            let age = Duration::from_secs(now.saturating_sub(entry.cached_at));
            let meta = CacheMeta { hit: true, age };
            if entry.is_expired(now) {
                (true, None)
            } else {
                let permitted = match static_token {
                    Some(token) => {
                        entry.kind == EntryKind::StaticSecret && entry.allowed_tokens.contains(token)
                    }
                    None => entry.kind != EntryKind::StaticSecret,
                };
                let hit = if permitted {
                    entry.response.as_ref().map(|r| r.to_response(meta))
                } else {
                    None
                };
                (false, hit)
            }
        };
        if expired {
            self.evict(id);
            return None;
        }
        if hit.is_some() {
            metrics::record_cache_lookup(true);
            tracing::debug!(id, "Cache hit");
        }
        hit
    }

    fn cache_static(
        &self,
        id: &str,
        namespace: &str,
        path: &str,
        token: &str,
        response: CachedResponse,
    ) {
        let mut entry = self.get(id).unwrap_or_else(|| {
            CacheEntry::new(id, EntryKind::StaticSecret, namespace, path)
        });
        entry.allowed_tokens.insert(token.to_string());
        entry.response = Some(response);
        entry.cached_at = unix_now();
        self.entries.insert(id.to_string(), entry);
        self.persist();
        tracing::debug!(path, "Cached static secret");
    }

    /// Returns true when the request was a revocation and the cache reacted.
    fn handle_revocation(&self, method: &Method, path: &str, token: Option<&str>, body: &[u8]) -> bool {
        if *method != Method::PUT && *method != Method::POST {
            return false;
        }
        let path = path.trim_start_matches("/v1/").trim_end_matches('/');
        let field = |name: &str| -> Option<String> {
            serde_json::from_slice::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get(name).and_then(|f| f.as_str()).map(str::to_string))
        };

        let evicted = match path {
            "auth/token/revoke-self" => match token {
                Some(token) => self.evict_token_tree(token),
                None => 0,
            },
            "auth/token/revoke" => match field("token") {
                Some(token) => self.evict_token_tree(&token),
                None => 0,
            },
            "auth/token/revoke-orphan" => match field("token") {
                Some(token) => self.evict_where(|e| e.is_token() && e.token.as_deref() == Some(token.as_str())),
                None => 0,
            },
            "auth/token/revoke-accessor" => {
                let token = field("accessor").and_then(|accessor| {
                    self.entries
                        .iter()
                        .find(|e| e.token_accessor.as_deref() == Some(accessor.as_str()))
                        .and_then(|e| e.token.clone())
                });
                match token {
                    Some(token) => self.evict_token_tree(&token),
                    None => 0,
                }
            }
            "sys/leases/revoke" | "sys/revoke" => match field("lease_id") {
                Some(lease) => self.evict_where(|e| e.lease.as_deref() == Some(lease.as_str())),
                None => 0,
            },
            _ => {
                if let Some(lease) = path
                    .strip_prefix("sys/leases/revoke/")
                    .or_else(|| path.strip_prefix("sys/revoke/"))
                {
                    self.evict_where(|e| e.lease.as_deref() == Some(lease))
                } else if let Some(prefix) = ["sys/leases/revoke-prefix/", "sys/leases/revoke-force/", "sys/revoke-prefix/", "sys/revoke-force/"]
                    .iter()
                    .find_map(|p| path.strip_prefix(p))
                {
                    self.evict_where(|e| e.lease.as_deref().is_some_and(|l| l.starts_with(prefix)))
                } else {
                    return false;
                }
            }
        };
        tracing::debug!(path, evicted, "Processed revocation request");
        true
    }

    async fn send_locked(
        &self,
        request: SendRequest,
        dynamic_id: &str,
        static_id: &str,
    ) -> Result<SendResponse, ProxyError> {
        let is_get = request.method == Method::GET;
        if let Some(hit) = self.lookup(dynamic_id, None) {
            return Ok(hit);
        }
        if self.cache_static_secrets && is_get {
            if let Some(token) = request.token.as_deref() {
                if let Some(hit) = self.lookup(static_id, Some(token)) {
                    return Ok(hit);
                }
            }
        }
        metrics::record_cache_lookup(false);

        let method = request.method.clone();
        let token = request.token.clone();
        let namespace = request.namespace();
        let path = request.path().to_string();
        let versioned = request.query().is_some_and(|q| q.contains("version="));
        let body = request.body.clone();

        let mut response = self.proxier.send(request).await?;
        response.cache_meta = Some(CacheMeta {
            hit: false,
            age: Duration::ZERO,
        });

        if !response.status.is_success() {
            return Ok(response);
        }
        if self.handle_revocation(&method, &path, token.as_deref(), &body) {
            return Ok(response);
        }
        if !is_get && self.cache_static_secrets && self.evict(static_id) {
            tracing::debug!(path = %path, "Write to static secret path, evicted cached copy");
        }
        if !response.is_json() {
            return Ok(response);
        }
        let Some(cached) = CachedResponse::from_response(&response) else {
            return Ok(response);
        };
        let secret: SecretResponse = match serde_json::from_slice(&response.body) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "Response is not a secret, not caching");
                return Ok(response);
            }
        };

        if self.cache_static_secrets && is_get && secret.mount_type == "kv" && !versioned {
            if let Some(token) = token.as_deref() {
                self.cache_static(static_id, &namespace, &path, token, cached);
            }
            return Ok(response);
        }
        if !self.cache_dynamic_secrets {
            return Ok(response);
        }

        let now = unix_now();
        let mut entry = CacheEntry::new(dynamic_id, EntryKind::Lease, namespace, path.clone());
        if !secret.lease_id.is_empty() {
            if !secret.renewable || secret.lease_duration == 0 {
                return Ok(response);
            }
            let Some(token) = token.filter(|t| self.is_managed(t)) else {
                tracing::debug!(path = %path, "Request token is not managed by the proxy, not caching lease");
                return Ok(response);
            };
            entry.lease = Some(secret.lease_id);
            entry.request_token = Some(token);
            entry.expires_at = Some(now + secret.lease_duration);
        } else if let Some(auth) = secret.auth.filter(|a| !a.client_token.is_empty()) {
            if !auth.renewable || auth.lease_duration == 0 {
                return Ok(response);
            }
            if !auth.orphan {
                let Some(parent) = token.filter(|t| self.is_managed(t)) else {
                    tracing::debug!(path = %path, "Parent token is not managed by the proxy, not caching token");
                    return Ok(response);
                };
                entry.request_token = Some(parent);
            }
            entry.kind = EntryKind::Token;
            entry.token = Some(auth.client_token);
            entry.token_accessor = Some(auth.accessor).filter(|a| !a.is_empty());
            entry.expires_at = Some(now + auth.lease_duration);
        } else {
            return Ok(response);
        }

        entry.response = Some(cached);
        self.entries.insert(dynamic_id.to_string(), entry);
        self.persist();
        tracing::debug!(path = %path, "Cached dynamic response");
        Ok(response)
    }
}

#[async_trait]
impl Proxier for LeaseCache {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, ProxyError> {
        let dynamic_id = dynamic_index_id(&request);
        let static_id = static_index_id(&request.namespace(), request.path());
        let guard_static = self.cache_static_secrets && request.method == Method::GET;

        let dynamic_lock = self.lock_for(&dynamic_id);
        let static_lock = guard_static.then(|| self.lock_for(&static_id));

        let result = {
            let _dynamic = dynamic_lock.lock().await;
            let _static = match &static_lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            self.send_locked(request, &dynamic_id, &static_id).await
        };

        drop(dynamic_lock);
        drop(static_lock);
        self.release_lock(&dynamic_id);
        if guard_static {
            self.release_lock(&static_id);
        }
        result
    }
}

fn normalize_namespace(namespace: &str) -> String {
    let ns = namespace.trim_matches('/');
    if ns.is_empty() {
        "root/".to_string()
    } else {
        format!("{}/", ns)
    }
}

async fn watch_base_context(cache: Weak<LeaseCache>, base: CancellationToken) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.tick().await;
    loop {
        tokio::select! {
            _ = base.cancelled() => {
                if let Some(cache) = cache.upgrade() {
                    cache.on_base_cancelled();
                }
                return;
            }
            _ = sweep.tick() => match cache.upgrade() {
                Some(cache) => cache.evict_expired(),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::header;
    use std::sync::atomic::AtomicUsize;

    /// Upstream double answering from a closure and counting calls.
    struct FakeUpstream {
        calls: AtomicUsize,
        respond: Box<dyn Fn(&SendRequest) -> (u16, String) + Send + Sync>,
    }

    impl FakeUpstream {
        fn new<F>(respond: F) -> Arc<Self>
        where
            F: Fn(&SendRequest) -> (u16, String) + Send + Sync + 'static,
        {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                respond: Box::new(respond),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Proxier for FakeUpstream {
        async fn send(&self, request: SendRequest) -> Result<SendResponse, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let (status, body) = (self.respond)(&request);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(SendResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers,
                body: Bytes::from(body),
                cache_meta: None,
            })
        }
    }

    fn lease_body() -> String {
        r#"{"lease_id":"db/creds/app/abc","lease_duration":3600,"renewable":true,"data":{"username":"u"}}"#.to_string()
    }

    fn request(method: Method, path: &str, token: &str) -> SendRequest {
        let mut request = SendRequest::new(method, path);
        request.token = Some(token.to_string());
        request
    }

    fn cache_with(upstream: Arc<FakeUpstream>, config: LeaseCacheConfig) -> (Arc<LeaseCache>, CancellationToken) {
        let base = CancellationToken::new();
        let cache = LeaseCache::new(upstream, config, base.clone());
        (cache, base)
    }

    fn dynamic_config() -> LeaseCacheConfig {
        LeaseCacheConfig {
            cache_dynamic_secrets: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lease_for_managed_token_is_cached() {
        let upstream = FakeUpstream::new(|_| (200, lease_body()));
        let (cache, _base) = cache_with(upstream.clone(), dynamic_config());
        cache.register_auto_auth_token("s.auto").unwrap();

        let first = cache.send(request(Method::GET, "/v1/db/creds/app", "s.auto")).await.unwrap();
        assert_eq!(first.cache_meta.map(|m| m.hit), Some(false));

        let second = cache.send(request(Method::GET, "/v1/db/creds/app", "s.auto")).await.unwrap();
        assert_eq!(second.cache_meta.map(|m| m.hit), Some(true));
        assert_eq!(second.body, first.body);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_token_not_cached() {
        let upstream = FakeUpstream::new(|_| (200, lease_body()));
        let (cache, _base) = cache_with(upstream.clone(), dynamic_config());

        cache.send(request(Method::GET, "/v1/db/creds/app", "s.stranger")).await.unwrap();
        cache.send(request(Method::GET, "/v1/db/creds/app", "s.stranger")).await.unwrap();
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_identical_requests_are_coalesced() {
        let upstream = FakeUpstream::new(|_| (200, lease_body()));
        let (cache, _base) = cache_with(upstream.clone(), dynamic_config());
        cache.register_auto_auth_token("s.auto").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.send(request(Method::GET, "/v1/db/creds/app", "s.auto")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_static_secret_shared_only_with_permitted_tokens() {
        let upstream = FakeUpstream::new(|_| (200, r#"{"mount_type":"kv","data":{"k":"v"}}"#.into()));
        let config = LeaseCacheConfig {
            cache_static_secrets: true,
            ..Default::default()
        };
        let (cache, _base) = cache_with(upstream.clone(), config);

        cache.send(request(Method::GET, "/v1/secret/foo", "s.a")).await.unwrap();
        let hit = cache.send(request(Method::GET, "/v1/secret/foo", "s.a")).await.unwrap();
        assert_eq!(hit.cache_meta.map(|m| m.hit), Some(true));

        let other = cache.send(request(Method::GET, "/v1/secret/foo", "s.b")).await.unwrap();
        assert_eq!(other.cache_meta.map(|m| m.hit), Some(false));
        assert_eq!(upstream.calls(), 2);

        let tokens = cache.static_secret_tokens();
        assert_eq!(tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_self_evicts_token_tree() {
        let upstream = FakeUpstream::new(|req| {
            if req.path().ends_with("revoke-self") {
                (204, String::new())
            } else {
                (200, lease_body())
            }
        });
        let (cache, _base) = cache_with(upstream.clone(), dynamic_config());
        cache.register_auto_auth_token("s.auto").unwrap();
        cache.send(request(Method::GET, "/v1/db/creds/app", "s.auto")).await.unwrap();
        assert_eq!(cache.len(), 2);

        cache
            .send(request(Method::POST, "/v1/auth/token/revoke-self", "s.auto"))
            .await
            .unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_clear_by_type() {
        let upstream = FakeUpstream::new(|_| (200, lease_body()));
        let (cache, _base) = cache_with(upstream, dynamic_config());
        cache.register_auto_auth_token("s.auto").unwrap();
        cache.send(request(Method::GET, "/v1/db/creds/app", "s.auto")).await.unwrap();

        let invalid = CacheClearRequest {
            clear_type: "everything".into(),
            ..Default::default()
        };
        assert!(matches!(cache.clear(&invalid), Err(CacheError::InvalidClearType(_))));

        let lease = CacheClearRequest {
            clear_type: "lease".into(),
            value: "db/creds/app/abc".into(),
            ..Default::default()
        };
        assert_eq!(cache.clear(&lease).unwrap(), 1);

        let all = CacheClearRequest {
            clear_type: "all".into(),
            ..Default::default()
        };
        assert_eq!(cache.clear(&all).unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_base_cancel_evicts_unless_shutting_down() {
        let upstream = FakeUpstream::new(|_| (200, lease_body()));

        let (cache, base) = cache_with(upstream.clone(), dynamic_config());
        cache.register_auto_auth_token("s.auto").unwrap();
        base.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty(), "entries must be evicted on plain cancellation");

        let (cache, base) = cache_with(upstream, dynamic_config());
        cache.register_auto_auth_token("s.auto").unwrap();
        cache.set_shutting_down(true);
        base.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 1, "entries must survive shutdown");
    }

    #[tokio::test]
    async fn test_shutdown_stops_capability_manager() {
        let upstream = FakeUpstream::new(|_| (200, "{}".into()));
        let (cache, _base) = cache_with(upstream, LeaseCacheConfig::default());
        let stop = CancellationToken::new();
        cache.attach_capability_manager(stop.clone());
        assert!(!stop.is_cancelled());
        cache.set_shutting_down(true);
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_persisted_entries_restored() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::from_config(&crate::config::PersistConfig {
            persist_type: "file".into(),
            path: dir.path().to_path_buf(),
            keep_after_import: true,
            exit_on_err: false,
        });
        let config = LeaseCacheConfig {
            cache_dynamic_secrets: true,
            persistence: Some(persistence),
            ..Default::default()
        };

        let upstream = FakeUpstream::new(|_| (200, lease_body()));
        let (cache, base) = cache_with(upstream.clone(), config.clone());
        cache.register_auto_auth_token("s.auto").unwrap();
        cache.send(request(Method::GET, "/v1/db/creds/app", "s.auto")).await.unwrap();
        cache.set_shutting_down(true);
        base.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (restored, _base) = cache_with(upstream.clone(), config);
        assert_eq!(restored.restore().unwrap(), 2);
        let hit = restored
            .send(request(Method::GET, "/v1/db/creds/app", "s.auto"))
            .await
            .unwrap();
        assert_eq!(hit.cache_meta.map(|m| m.hit), Some(true));
        assert_eq!(upstream.calls(), 1);
    }
}
