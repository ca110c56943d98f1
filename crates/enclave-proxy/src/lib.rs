//! # enclave-proxy: LLM traffic from the sandbox to the gateway
//!
//! The runtime has no network. Its LLM client talks HTTP/1.1 to a Unix socket
//! inside the job directory; this proxy forwards each request to a fixed
//! upstream base URL and streams the response back chunk by chunk.
//!
//! Any upstream status >= 400 (or an unreachable upstream) on a path outside
//! the non-critical allow-list trips the fatal callback, which the executor
//! uses to kill the run. The callback fires at most once per proxy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::CONNECTION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use enclave_sandbox::{SandboxError, bind_private_listener};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Headers that describe one hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub upstream_base_url: String,
    pub max_body_bytes: usize,
    /// Path prefixes whose failures are logged but never fatal.
    pub non_critical_paths: Vec<String>,
    /// How much of an upstream error body is kept for logging.
    pub error_preview_bytes: usize,
    pub connect_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: "http://127.0.0.1:4000".to_owned(),
            max_body_bytes: 10 * 1024 * 1024,
            non_critical_paths: [
                "/health",
                "/v1/health",
                "/telemetry",
                "/v1/telemetry",
                "/api/event_logging",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            error_preview_bytes: 2048,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream url {url:?}: {message}")]
    InvalidUpstream { url: String, message: String },
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Why the proxy declared the run dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalProxyError {
    pub path: String,
    /// `None` when the upstream could not be reached at all.
    pub status: Option<u16>,
    pub detail: String,
}

impl std::fmt::Display for FatalProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "LLM gateway returned {status} for {}: {}", self.path, self.detail),
            None => write!(f, "LLM gateway unreachable for {}: {}", self.path, self.detail),
        }
    }
}

pub type FatalCallback = Arc<dyn Fn(FatalProxyError) + Send + Sync>;

struct FatalLatch {
    fired: AtomicBool,
    callback: FatalCallback,
}

impl FatalLatch {
    fn fire(&self, fatal: FatalProxyError) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!(path = %fatal.path, status = ?fatal.status, "fatal LLM gateway error");
            (self.callback)(fatal);
        } else {
            debug!(path = %fatal.path, "fatal callback already fired");
        }
    }
}

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    upstream: Arc<str>,
    non_critical: Arc<[String]>,
    max_body_bytes: usize,
    error_preview_bytes: usize,
    latch: Arc<FatalLatch>,
}

impl ProxyState {
    fn is_non_critical(&self, path: &str) -> bool {
        self.non_critical.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One proxy instance, bound to one job's `llm.sock`.
pub struct LlmProxy {
    socket_path: PathBuf,
    config: ProxyConfig,
    latch: Arc<FatalLatch>,
    running: Mutex<Option<Running>>,
}

impl LlmProxy {
    pub fn new(socket_path: impl Into<PathBuf>, config: ProxyConfig, on_fatal: FatalCallback) -> Self {
        Self {
            socket_path: socket_path.into(),
            config,
            latch: Arc::new(FatalLatch {
                fired: AtomicBool::new(false),
                callback: on_fatal,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn fatal_fired(&self) -> bool {
        self.latch.fired.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bind the socket and start serving. Calling it again while running is
    /// a no-op. Must be called inside a tokio runtime.
    pub fn start(&self) -> ProxyResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let upstream = self.config.upstream_base_url.trim_end_matches('/');
        reqwest::Url::parse(upstream).map_err(|error| ProxyError::InvalidUpstream {
            url: upstream.to_owned(),
            message: error.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs.max(1)))
            .no_proxy()
            .build()
            .map_err(|error| ProxyError::Client(error.to_string()))?;

        let state = ProxyState {
            client,
            upstream: Arc::from(upstream),
            non_critical: self.config.non_critical_paths.clone().into(),
            max_body_bytes: self.config.max_body_bytes,
            error_preview_bytes: self.config.error_preview_bytes,
            latch: Arc::clone(&self.latch),
        };
        let app = Router::new()
            .fallback(forward)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let listener = bind_private_listener(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), upstream, "LLM proxy listening");

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(error) = served {
                warn!(error = %error, "LLM proxy server exited with error");
            }
            debug!("LLM proxy shut down");
        });

        *running = Some(Running { shutdown, task });
        Ok(())
    }

    /// Stop serving and remove the socket file. Safe to call repeatedly, and
    /// removes the socket even if the proxy never started.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { shutdown, mut task }) = running {
            let _ = shutdown.send(true);
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                debug!("LLM proxy still draining connections, aborting");
                task.abort();
            }
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(socket = %self.socket_path.display(), error = %error, "failed to remove proxy socket"),
        }
    }
}

impl Drop for LlmProxy {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
            running.task.abort();
        }
    }
}

/// Drops the fixed hop-by-hop set plus any header the `Connection` header
/// names (RFC 9110 §7.6.1).
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP_HEADERS.contains(&name) && !connection_listed.iter().any(|listed| listed == name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn preview(body: &[u8], limit: usize) -> String {
    let cut = body.len().min(limit);
    let mut text = String::from_utf8_lossy(&body[..cut]).into_owned();
    if body.len() > limit {
        text.push_str("...");
    }
    text
}

/// Reset or broken pipe: the sandbox went away mid-stream.
fn is_disconnect(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(io) = error.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            )
        {
            return true;
        }
        current = error.source();
    }
    false
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_owned();
    let target = match parts.uri.path_and_query() {
        Some(path_and_query) => format!("{}{}", state.upstream, path_and_query.as_str()),
        None => format!("{}{path}", state.upstream),
    };

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(error) => {
            warn!(path = %path, error = %error, "rejecting oversized or unreadable request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let sent = state
        .client
        .request(parts.method.clone(), &target)
        .headers(forwardable_headers(&parts.headers))
        .body(body)
        .send()
        .await;
    let upstream = match sent {
        Ok(upstream) => upstream,
        Err(error) => {
            warn!(path = %path, error = %error, "upstream request failed");
            if error.is_connect() && !state.is_non_critical(&path) {
                state.latch.fire(FatalProxyError {
                    path: path.clone(),
                    status: None,
                    detail: error.to_string(),
                });
            }
            return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
        }
    };

    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());

    if status.as_u16() >= 400 {
        let body = upstream.bytes().await.unwrap_or_else(|error| {
            debug!(path = %path, error = %error, "failed to read upstream error body");
            Bytes::new()
        });
        let detail = preview(&body, state.error_preview_bytes);
        debug!(path = %path, status = status.as_u16(), body = %detail, "upstream error body");
        warn!(path = %path, status = status.as_u16(), "upstream returned error status");
        if !state.is_non_critical(&path) {
            state.latch.fire(FatalProxyError {
                path,
                status: Some(status.as_u16()),
                detail,
            });
        }
        return respond(status, headers, Body::from(body));
    }

    let upstream_stream = upstream.bytes_stream();
    let body_stream = async_stream::stream! {
        tokio::pin!(upstream_stream);
        while let Some(chunk) = upstream_stream.next().await {
            match chunk {
                Ok(chunk) => yield Ok::<_, std::io::Error>(chunk),
                Err(error) if is_disconnect(&error) => {
                    debug!(path = %path, error = %error, "stream closed mid-response");
                    break;
                }
                Err(error) => {
                    warn!(path = %path, error = %error, "upstream stream error");
                    yield Err(std::io::Error::other(error.to_string()));
                    break;
                }
            }
        }
    };
    respond(status, headers, Body::from_stream(body_stream))
}
