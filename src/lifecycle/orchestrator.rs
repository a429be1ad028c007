//! Startup, supervision and teardown of the whole proxy.
//!
//! # Responsibilities
//! - Build the upstream client, API proxy and optional lease cache
//! - Build auto-auth, sinks and the in-memory token sources
//! - Bind every listener before any of them serves
//! - Run all long-lived tasks as one run group
//! - Tear down listeners and the PID file exactly once
//!
//! # Design Decisions
//! - Fail fast: every startup error is returned before an actor starts
//! - Listeners are actors; a serve failure stops the process
//! - Shutdown marks the cache before cancelling the shared context

use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::{build_method, AuthError, AuthHandler, AuthHandlerConfig};
use crate::cache::{CacheError, CapabilityManager, LeaseCache, LeaseCacheConfig, StaticSecretUpdater};
use crate::config::Config;
use crate::http::{build_router, RouterState};
use crate::lifecycle::pidfile::PidFile;
use crate::lifecycle::reload::{ConfigReloader, Reload, ReloadError, ReloadReceiver};
use crate::lifecycle::run_group::{ActorError, RunGroup};
use crate::lifecycle::shutdown::{Shutdown, ShutdownSequence};
use crate::lifecycle::{signals, systemd};
use crate::net::{
    serve, start_listener, InProcessDialer, ListenerAddress, ListenerError, RegisteredTls,
    TlsRegistry,
};
use crate::observability::{metrics, LogHandle};
use crate::proxy::consistency::ConsistencyError;
use crate::proxy::handler::ProxyState;
use crate::proxy::{ApiProxy, ClientError, ConsistencyPolicy, Proxier, UpstreamClient};
use crate::sink::inmem::{InmemSink, TokenSource};
use crate::sink::server::{close_sinks, spawn_drain, SinkServer};
use crate::sink::{build_sinks, Sink, SinkError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to create upstream client: {0}")]
    Client(#[from] ClientError),

    #[error("invalid api_proxy configuration: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("failed to set up auto-auth: {0}")]
    Auth(#[from] AuthError),

    #[error("failed to set up sinks: {0}")]
    Sink(#[from] SinkError),

    #[error("failed to restore cache: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to write PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Sent once every actor is registered and listeners are bound.
pub struct StartedInfo {
    pub addresses: Vec<ListenerAddress>,
    /// One per in-process listener, in listener order.
    pub dialers: Vec<InProcessDialer>,
}

/// Closes listeners and removes the PID file, once.
struct Cleanup {
    once: Once,
    listeners: Vec<CancellationToken>,
    sockets: Vec<PathBuf>,
    pid_file: Mutex<Option<PidFile>>,
}

impl Cleanup {
    fn run(&self) {
        self.once.call_once(|| {
            for listener in &self.listeners {
                listener.cancel();
            }
            remove_sockets(&self.sockets);
            if let Some(pid_file) = self.pid_file.lock().ok().and_then(|mut slot| slot.take()) {
                pid_file.remove();
            }
            tracing::debug!("Listeners closed");
        });
    }
}

fn remove_sockets(sockets: &[PathBuf]) {
    for socket in sockets {
        if let Err(e) = std::fs::remove_file(socket) {
            tracing::debug!(path = %socket.display(), error = %e, "Socket file not removed");
        }
    }
}

struct AutoAuth {
    handler: AuthHandler,
    tokens: mpsc::Receiver<crate::auth::TokenEvent>,
    method: Arc<dyn crate::auth::AuthMethod>,
    sinks: Vec<Arc<dyn Sink>>,
    updater_tokens: Option<TokenSource>,
    proxy_tokens: Option<TokenSource>,
}

pub struct Orchestrator {
    config: Arc<ArcSwap<Config>>,
    config_paths: Vec<PathBuf>,
    log: LogHandle,
    shutdown: Shutdown,
    reload: Reload,
    reload_rx: ReloadReceiver,
    os_signals: bool,
    started: Option<oneshot::Sender<StartedInfo>>,
    reloaded: Option<mpsc::UnboundedSender<Result<(), Arc<ReloadError>>>>,
    #[cfg(test)]
    failing_listener: Option<(usize, std::time::Duration)>,
}

impl Orchestrator {
    /// `config` must already be validated. `config_paths` are re-read on reload.
    pub fn new(config: Config, config_paths: Vec<PathBuf>, log: LogHandle) -> Self {
        let (reload, reload_rx) = Reload::channel();
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_paths,
            log,
            shutdown: Shutdown::new(),
            reload,
            reload_rx,
            os_signals: false,
            started: None,
            reloaded: None,
            #[cfg(test)]
            failing_listener: None,
        }
    }

    /// Forward SIGHUP, SIGINT and SIGTERM.
    pub fn with_os_signals(mut self) -> Self {
        self.os_signals = true;
        self
    }

    pub fn on_started(mut self, tx: oneshot::Sender<StartedInfo>) -> Self {
        self.started = Some(tx);
        self
    }

    pub fn on_reloaded(mut self, tx: mpsc::UnboundedSender<Result<(), Arc<ReloadError>>>) -> Self {
        self.reloaded = Some(tx);
        self
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn reload_handle(&self) -> Reload {
        self.reload.clone()
    }

    pub fn config(&self) -> Arc<ArcSwap<Config>> {
        self.config.clone()
    }

    /// Run until an actor returns. `Ok` only when no actor failed.
    pub async fn run(self) -> Result<(), OrchestratorError> {
        let config = self.config.load_full();
        let ctx = CancellationToken::new();
        // Startup errors return early; nothing spawned on `ctx` may outlive them.
        let _cancel_on_return = ctx.clone().drop_guard();
        let metrics_handle = metrics::install();

        let client = UpstreamClient::from_config(&config.vault)?;
        let policy = ConsistencyPolicy::from_config(config.api_proxy.as_ref())?;
        let prepend_namespace = config
            .api_proxy
            .as_ref()
            .is_some_and(|p| p.prepend_configured_namespace);
        let api_proxy: Arc<dyn Proxier> = Arc::new(ApiProxy::new(client.clone(), policy, prepend_namespace));

        let cache = match &config.cache {
            Some(cache_config) => {
                let cache = LeaseCache::new(
                    api_proxy.clone(),
                    LeaseCacheConfig::from_config(cache_config),
                    ctx.clone(),
                );
                if let Err(e) = cache.restore() {
                    let fatal = cache_config.persist.as_ref().is_some_and(|p| p.exit_on_err);
                    if fatal {
                        return Err(e.into());
                    }
                    tracing::warn!(error = %e, "Failed to restore cache, starting empty");
                }
                tracing::info!(
                    static_secrets = cache_config.cache_static_secrets,
                    dynamic_secrets = !cache_config.disable_caching_dynamic_secrets,
                    "Lease cache enabled"
                );
                Some(cache)
            }
            None => None,
        };

        let auto_auth = self.build_auto_auth(&config, &client, cache.as_ref())?;

        let proxier: Arc<dyn Proxier> = match &cache {
            Some(cache) => cache.clone(),
            None => api_proxy,
        };
        let force_auto_auth_token = config
            .api_proxy
            .as_ref()
            .is_some_and(|p| p.use_auto_auth_token.forced());
        let router_state = RouterState {
            proxy: ProxyState {
                proxier,
                auto_auth_token: auto_auth.as_ref().and_then(|a| a.proxy_tokens.clone()),
                force_auto_auth_token,
            },
            cache: cache.clone(),
            shutdown: self.shutdown.clone(),
            metrics: metrics_handle,
            quit_enabled: false,
        };

        let registry = Arc::new(TlsRegistry::new());
        let mut bundles = Vec::with_capacity(config.listeners.len());
        {
            let mut entries = registry.write().await;
            for (index, listener_config) in config.listeners.iter().enumerate() {
                let bundle = start_listener(listener_config).await?;
                #[cfg(test)]
                let bundle = self.break_listener(index, bundle);
                if let Some(tls) = &bundle.tls {
                    entries.push(RegisteredTls {
                        listener: bundle.address.to_string(),
                        reloader: tls.clone(),
                    });
                }
                tracing::info!("api address {}: {}", index + 1, bundle.address);
                bundles.push((listener_config, bundle));
            }
        }

        let sockets: Vec<PathBuf> = bundles
            .iter()
            .filter_map(|(_, bundle)| match &bundle.address {
                ListenerAddress::Unix(path) => Some(path.clone()),
                _ => None,
            })
            .collect();
        let pid_file = match &config.pid_file {
            Some(path) => match PidFile::create(path) {
                Ok(pid_file) => Some(pid_file),
                Err(source) => {
                    remove_sockets(&sockets);
                    return Err(OrchestratorError::PidFile {
                        path: path.clone(),
                        source,
                    });
                }
            },
            None => None,
        };

        if self.os_signals {
            signals::spawn_signal_forwarder(self.shutdown.clone(), self.reload.clone(), ctx.clone());
        }

        let sequence = ShutdownSequence::new(cache.clone(), ctx.clone());
        let interrupt = || {
            let sequence = sequence.clone();
            move || sequence.begin()
        };
        let mut group = RunGroup::new();

        let mut reloader = ConfigReloader::new(
            self.config_paths.clone(),
            self.config.clone(),
            self.log.clone(),
            registry.clone(),
        );
        if let Some(tx) = self.reloaded.clone() {
            reloader = reloader.with_notifications(tx);
        }
        let mut reload_rx = self.reload_rx;
        let reload_ctx = ctx.clone();
        group.add(
            "reload",
            async move {
                loop {
                    tokio::select! {
                        _ = reload_ctx.cancelled() => return Ok(()),
                        signal = reload_rx.recv() => match signal {
                            Some(()) => reloader.reload_and_notify().await,
                            None => {
                                reload_ctx.cancelled().await;
                                return Ok(());
                            }
                        },
                    }
                }
            },
            interrupt(),
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let shutdown_ctx = ctx.clone();
        let shutdown_sequence = sequence.clone();
        group.add(
            "shutdown",
            async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Shutdown triggered");
                        shutdown_sequence.begin();
                    }
                    _ = shutdown_ctx.cancelled() => {}
                }
                Ok(())
            },
            interrupt(),
        );

        let mut updater_tokens = None;
        if let Some(auto_auth) = auto_auth {
            let AutoAuth {
                handler,
                mut tokens,
                method,
                sinks,
                updater_tokens: updater,
                ..
            } = auto_auth;
            updater_tokens = updater;

            let auth_ctx = ctx.clone();
            group.add(
                "auth-handler",
                async move { handler.run(auth_ctx, method).await.map_err(ActorError::from) },
                interrupt(),
            );

            let sink_ctx = ctx.clone();
            let server = SinkServer::new(config.exit_after_auth);
            group.add(
                "sink-server",
                async move {
                    let result = server.run(&sink_ctx, &mut tokens, &sinks).await;
                    spawn_drain(tokens, sink_ctx);
                    close_sinks(&sinks).await;
                    result.map_err(ActorError::from)
                },
                interrupt(),
            );
        }

        if let Some(cache) = cache.as_ref().filter(|c| c.cache_static_secrets()) {
            match updater_tokens {
                Some(tokens) => {
                    let updater = StaticSecretUpdater::new(cache.clone(), client.clone(), tokens);
                    let updater_ctx = ctx.clone();
                    group.add(
                        "static-secret-updater",
                        async move { updater.run(updater_ctx).await.map_err(ActorError::from) },
                        interrupt(),
                    );
                }
                None => tracing::warn!("Static secret caching without auto_auth, cached secrets will not be refreshed"),
            }
            let interval = config
                .cache
                .as_ref()
                .map(|c| c.static_secret_token_capability_refresh_interval)
                .unwrap_or_default();
            if !interval.is_zero() {
                let manager = CapabilityManager::new(cache.clone(), client.clone(), interval, &ctx);
                tokio::spawn(manager.run());
            }
        }

        let mut addresses = Vec::with_capacity(bundles.len());
        let mut dialers = Vec::new();
        let mut listener_tokens = Vec::with_capacity(bundles.len());
        for (listener_config, bundle) in bundles {
            let token = ctx.child_token();
            listener_tokens.push(token.clone());
            if let Some(dialer) = bundle.dialer {
                dialers.push(dialer);
            }
            addresses.push(bundle.address.clone());

            let router = build_router(listener_config, router_state.clone());
            let address = bundle.address.to_string();
            let serve_token = token.clone();
            let listener = bundle.listener;
            let tls = bundle.tls;
            let sequence = sequence.clone();
            group.add(
                format!("listener {}", address),
                async move {
                    serve(listener, tls, router, serve_token)
                        .await
                        .map_err(|source| ActorError::Listener { address, source })
                },
                move || {
                    sequence.begin();
                    token.cancel();
                },
            );
        }

        let cleanup = Cleanup {
            once: Once::new(),
            listeners: listener_tokens,
            sockets,
            pid_file: Mutex::new(pid_file),
        };

        systemd::notify(systemd::READY);
        tracing::info!(actors = group.len(), "Proxy started");
        if let Some(started) = self.started {
            let _ = started.send(StartedInfo { addresses, dialers });
        }

        let result = group.run().await;

        systemd::notify(systemd::STOPPING);
        cleanup.run();
        match &result {
            Ok(()) => tracing::info!("Proxy stopped"),
            Err(e) => tracing::error!(error = %e, "Proxy stopped with error"),
        }
        result.map_err(OrchestratorError::from)
    }

    #[cfg(test)]
    fn break_listener(
        &self,
        index: usize,
        mut bundle: crate::net::ListenerBundle,
    ) -> crate::net::ListenerBundle {
        if let Some((failing, after)) = self.failing_listener.filter(|(i, _)| *i == index) {
            tracing::debug!(listener = failing, "Listener will fail after startup");
            bundle.listener = crate::net::BoundListener::Failing { after };
        }
        bundle
    }

    fn build_auto_auth(
        &self,
        config: &Config,
        client: &UpstreamClient,
        cache: Option<&Arc<LeaseCache>>,
    ) -> Result<Option<AutoAuth>, OrchestratorError> {
        let Some(auto_auth) = &config.auto_auth else {
            return Ok(None);
        };

        let method = build_method(&auto_auth.method, client)?;
        let mut sinks = build_sinks(&auto_auth.sinks)?;

        let updater_tokens = match cache {
            Some(cache) if cache.cache_static_secrets() => {
                let sink = InmemSink::new(None);
                let source = sink.source();
                sinks.push(Arc::new(sink));
                Some(source)
            }
            _ => None,
        };

        let proxy_tokens = if config.use_auto_auth_token() {
            let sink = InmemSink::new(cache.cloned());
            let source = sink.source();
            sinks.push(Arc::new(sink));
            Some(source)
        } else {
            None
        };

        let (handler, tokens) = AuthHandler::new(AuthHandlerConfig::from_config(auto_auth));
        tracing::info!(
            method = method.name(),
            sinks = sinks.len(),
            "Auto-auth configured"
        );
        Ok(Some(AutoAuth {
            handler,
            tokens,
            method,
            sinks,
            updater_tokens,
            proxy_tokens,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenEvent;
    use crate::config::{
        ApiProxyConfig, AutoAuthConfig, ListenerConfig, ListenerType, MethodConfig, SinkConfig,
        UseAutoAuthToken, VaultConfig,
    };
    use crate::net::DialError;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tracing_subscriber::filter::LevelFilter;

    fn in_process() -> ListenerConfig {
        ListenerConfig {
            listener_type: ListenerType::InProcess,
            ..ListenerConfig::tcp("")
        }
    }

    fn config() -> Config {
        Config {
            vault: VaultConfig {
                address: "http://127.0.0.1:8200".into(),
                ..Default::default()
            },
            listeners: vec![in_process(), in_process()],
            ..Default::default()
        }
    }

    fn orchestrator(config: Config) -> Orchestrator {
        Orchestrator::new(config, Vec::new(), LogHandle::detached(LevelFilter::INFO))
    }

    #[tokio::test]
    async fn test_listener_failure_after_startup_ends_run() {
        let (tx, rx) = oneshot::channel();
        let mut orchestrator = orchestrator(config()).on_started(tx);
        orchestrator.failing_listener = Some((1, Duration::from_millis(300)));
        let task = tokio::spawn(orchestrator.run());

        let started = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        let healthy = started.dialers[0].clone();
        let request = Request::builder()
            .uri("/proxy/v1/metrics")
            .header("host", "in-process")
            .body(Body::empty())
            .unwrap();
        assert_eq!(healthy.request(request).await.unwrap().status(), 200);

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        match result {
            Err(OrchestratorError::Actor(ActorError::Listener { address, source })) => {
                assert_eq!(address, "http://in-process");
                assert_eq!(source.to_string(), "accept failed");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(healthy.dial().await, Err(DialError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pid_file_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let socket = dir.path().join("proxy.sock");

        let mut config = config();
        let mut unix = ListenerConfig::tcp(socket.to_string_lossy());
        unix.listener_type = ListenerType::Unix;
        config.listeners.push(unix);
        config.pid_file = Some(blocker.join("proxy.pid"));

        let result = tokio::time::timeout(Duration::from_secs(5), orchestrator(config).run())
            .await
            .unwrap();
        assert!(matches!(result, Err(OrchestratorError::PidFile { .. })), "{:?}", result);
        assert!(!socket.exists());
    }

    fn approle(dir: &std::path::Path) -> MethodConfig {
        let mut method = MethodConfig::new("approle");
        for name in ["role_id", "secret_id"] {
            let path = dir.join(name);
            std::fs::write(&path, format!("test-{}", name)).unwrap();
            method.config.insert(
                format!("{}_file_path", name),
                toml::Value::String(path.to_string_lossy().into_owned()),
            );
        }
        method
    }

    #[tokio::test]
    async fn test_proxy_token_published_after_file_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let mut config = config();
        config.auto_auth = Some(AutoAuthConfig {
            method: approle(dir.path()),
            sinks: vec![SinkConfig::file(&first), SinkConfig::file(&second)],
            enable_reauth_on_new_credentials: false,
        });
        config.api_proxy = Some(ApiProxyConfig {
            use_auto_auth_token: UseAutoAuthToken::Flag(true),
            ..Default::default()
        });

        let client = UpstreamClient::from_config(&config.vault).unwrap();
        let auto_auth = orchestrator(config.clone())
            .build_auto_auth(&config, &client, None)
            .unwrap()
            .unwrap();
        let mut source = auto_auth.proxy_tokens.clone().unwrap();
        let sinks = auto_auth.sinks;

        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let server_ctx = ctx.clone();
        let server = tokio::spawn(async move {
            SinkServer::new(false).run(&server_ctx, &mut rx, &sinks).await
        });

        for (generation, token) in ["s.first", "s.second"].into_iter().enumerate() {
            tx.send(TokenEvent {
                token: token.to_string(),
                generation: generation as u64 + 1,
            })
            .await
            .unwrap();
            let seen = tokio::time::timeout(Duration::from_secs(5), source.next_token())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&*seen, token);
            assert_eq!(std::fs::read_to_string(&first).unwrap(), token);
            assert_eq!(std::fs::read_to_string(&second).unwrap(), token);
        }

        ctx.cancel();
        server.await.unwrap().unwrap();
    }
}
