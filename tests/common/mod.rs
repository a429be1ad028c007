//! Shared utilities for integration testing.
#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use vault_proxy::config::{
    AutoAuthConfig, Config, ListenerConfig, ListenerRole, ListenerType, MethodConfig, SinkConfig,
    VaultConfig,
};
use vault_proxy::lifecycle::orchestrator::OrchestratorError;
use vault_proxy::lifecycle::{Orchestrator, Shutdown, StartedInfo};
use vault_proxy::net::InProcessDialer;
use vault_proxy::observability::LogHandle;

pub const LOGIN_PATH: &str = "/v1/auth/approle/login";

/// A request as seen by the mock upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Recorded {
    pub fn token(&self) -> Option<&str> {
        self.headers.get("x-vault-token").and_then(|v| v.to_str().ok())
    }
}

type Responder =
    Arc<dyn Fn(Recorded) -> Pin<Box<dyn Future<Output = (u16, String)> + Send>> + Send + Sync>;

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<Recorded>>>,
    responder: Responder,
}

/// Programmable upstream bound to an ephemeral port.
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockUpstream {
    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }
}

async fn mock_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let recorded = Recorded {
        method,
        path: uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_default(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    state.requests.lock().unwrap().push(recorded.clone());
    let (status, body) = (state.responder)(recorded).await;
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Start a mock upstream whose responses come from `f`.
pub async fn start_mock_upstream<F, Fut>(f: F) -> MockUpstream
where
    F: Fn(Recorded) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        requests: requests.clone(),
        responder: Arc::new(move |r| Box::pin(f(r))),
    };
    let app = Router::new().fallback(mock_handler).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockUpstream { addr, requests }
}

/// Login response for an approle login returning `token`.
pub fn login_body(token: &str) -> String {
    serde_json::json!({
        "auth": {
            "client_token": token,
            "accessor": format!("{}-accessor", token),
            "lease_duration": 3600,
            "renewable": true,
        }
    })
    .to_string()
}

/// A mock upstream that accepts approle logins and answers everything else with `{}`.
pub async fn start_login_upstream(token: &'static str) -> MockUpstream {
    start_mock_upstream(move |r| async move {
        if r.path == LOGIN_PATH {
            (200, login_body(token))
        } else {
            (200, "{}".to_string())
        }
    })
    .await
}

/// Minimal config pointing at `upstream` with one in-process listener.
pub fn base_config(upstream: &str) -> Config {
    Config {
        vault: VaultConfig {
            address: upstream.to_string(),
            ..Default::default()
        },
        listeners: vec![in_process_listener()],
        ..Default::default()
    }
}

pub fn in_process_listener() -> ListenerConfig {
    ListenerConfig {
        listener_type: ListenerType::InProcess,
        address: String::new(),
        ..ListenerConfig::tcp("")
    }
}

pub fn metrics_only_listener() -> ListenerConfig {
    ListenerConfig {
        role: ListenerRole::MetricsOnly,
        ..in_process_listener()
    }
}

/// Approle auto-auth reading credentials from `dir`, writing to `sinks`.
pub fn approle_auto_auth(dir: &Path, sinks: Vec<SinkConfig>) -> AutoAuthConfig {
    let role_id = dir.join("role_id");
    let secret_id = dir.join("secret_id");
    std::fs::write(&role_id, "test-role").unwrap();
    std::fs::write(&secret_id, "test-secret").unwrap();

    let mut method = MethodConfig::new("approle");
    method.min_backoff = Duration::from_millis(50);
    method.max_backoff = Duration::from_millis(200);
    method.config.insert(
        "role_id_file_path".into(),
        toml::Value::String(role_id.to_string_lossy().into_owned()),
    );
    method.config.insert(
        "secret_id_file_path".into(),
        toml::Value::String(secret_id.to_string_lossy().into_owned()),
    );
    method.config.insert(
        "remove_secret_id_file_after_reading".into(),
        toml::Value::Boolean(false),
    );
    AutoAuthConfig {
        method,
        sinks,
        enable_reauth_on_new_credentials: false,
    }
}

/// A running proxy and the handles tests drive it with.
pub struct RunningProxy {
    pub started: StartedInfo,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), OrchestratorError>>,
}

impl RunningProxy {
    pub fn dialer(&self) -> &InProcessDialer {
        &self.started.dialers[0]
    }

    /// Trigger shutdown and wait for the run group to finish.
    pub async fn stop(self) -> Result<(), OrchestratorError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("proxy did not stop")
            .expect("proxy task panicked")
    }
}

pub fn orchestrator(config: Config) -> Orchestrator {
    Orchestrator::new(
        config,
        Vec::new(),
        LogHandle::detached(tracing_subscriber::filter::LevelFilter::INFO),
    )
}

/// Start `orchestrator` and wait until its listeners are bound.
pub async fn start(orchestrator: Orchestrator) -> RunningProxy {
    let (tx, rx) = oneshot::channel();
    let orchestrator = orchestrator.on_started(tx);
    let shutdown = orchestrator.shutdown_handle();
    let task = tokio::spawn(orchestrator.run());
    let started = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("proxy did not start")
        .expect("proxy exited before starting");
    RunningProxy {
        started,
        shutdown,
        task,
    }
}

/// Send a request through the in-process dialer and collect the body.
pub async fn call(
    dialer: &InProcessDialer,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "in-process");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    let response = dialer.request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

/// Poll until `condition` holds, failing after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
