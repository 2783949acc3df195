//! HTTP front end for the sandboxed execution service.
//!
//! `POST /run` takes a multipart form whose `src` field is a C source file,
//! stages it on the host, hands it to a [`CodeRunner`] and maps the outcome to
//! a status code. Every run executes on its own task with a cancellation
//! token derived from the server's root token: a client that disconnects, or
//! a server that shuts down, cancels the run and the sandbox is removed
//! before the task ends.

pub mod error;
pub mod staging;

pub use error::{Result, ServerError};

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use sandrun_core::{CodeRunner, CompletionReason, ExecutionRequest, ServerSettings};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Name of the multipart field carrying the source file.
pub const SOURCE_FIELD: &str = "src";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct TimeoutResponse {
    pub error: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory served for any path without a route
    pub static_dir: Option<PathBuf>,
    /// Maximum request body size in bytes, multipart envelope included
    pub max_body_size: usize,
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            bind_addr: settings.bind_addr,
            static_dir: settings.static_dir.clone(),
            max_body_size: settings.max_body_bytes,
            enable_logging: true,
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn CodeRunner>,
    /// Root token; every run's token is a child of it.
    pub shutdown: CancellationToken,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Pulls the `src` field out of the form and checks its size before anything
/// touches the disk.
async fn read_source_field(multipart: &mut Multipart, max_source_bytes: u64) -> Result<Vec<u8>> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(SOURCE_FIELD) {
            continue;
        }

        let data = field.bytes().await?;
        if data.is_empty() {
            return Err(ServerError::bad_request("submitted source is empty"));
        }
        let size = data.len() as u64;
        if size > max_source_bytes {
            return Err(ServerError::PayloadTooLarge {
                size,
                limit: max_source_bytes,
            });
        }
        return Ok(data.to_vec());
    }

    Err(ServerError::bad_request(format!(
        "missing multipart field '{}'",
        SOURCE_FIELD
    )))
}

/// Handler for the /run POST endpoint.
async fn run_handler(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response> {
    let source = read_source_field(&mut multipart, state.runner.max_source_bytes()).await?;
    let staged = staging::stage_source(&source).await?;
    let request = ExecutionRequest::new(staged.path(), staged.size());
    let request_id = request.id;
    log::info!("request={} accepted {} bytes", request_id, staged.size());

    // Dropping this handler (client gone) drops the guard and cancels the run.
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();

    let runner = state.runner.clone();
    let run = tokio::spawn(async move {
        let result = runner.run(request, cancel).await;
        drop(staged);
        result
    });

    let result = run
        .await
        .map_err(|e| ServerError::internal(format!("run task for request {} failed: {}", request_id, e)))??;
    guard.disarm();

    let response = match result.reason {
        CompletionReason::Completed => Json(RunResponse {
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            truncated: result.truncated,
        })
        .into_response(),
        CompletionReason::TimedOut => (
            StatusCode::REQUEST_TIMEOUT,
            Json(TimeoutResponse {
                error: format!(
                    "Execution time exceeded {}sec limit",
                    state.runner.deadline().as_secs()
                ),
                stdout: result.stdout_lossy(),
                stderr: result.stderr_lossy(),
            }),
        )
            .into_response(),
        CompletionReason::Canceled if state.shutdown.is_cancelled() => {
            log::info!("request={} canceled by server shutdown", request_id);
            return Err(ServerError::ShuttingDown);
        }
        CompletionReason::Canceled => {
            log::info!("request={} canceled after the client went away", request_id);
            return Err(ServerError::ClientClosed);
        }
    };

    Ok(response)
}

/// The execution service's HTTP server.
pub struct SandrunServer {
    runner: Arc<dyn CodeRunner>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl SandrunServer {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self::with_config(runner, ServerConfig::default())
    }

    pub fn with_config(runner: Arc<dyn CodeRunner>, config: ServerConfig) -> Self {
        Self {
            runner,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Cancelling this token cancels every in-flight run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            runner: self.runner.clone(),
            shutdown: self.shutdown.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/run", post(run_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        if let Some(dir) = &self.config.static_dir {
            router = router.fallback_service(ServeDir::new(dir));
        }

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::extract::Request, next: middleware::Next| async move {
                    let request_id = uuid::Uuid::new_v4();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    log::info!("Request {} {} {}", request_id, method, uri);

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::info!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Serves until `shutdown_signal` resolves, then cancels every in-flight
    /// run and waits for their connections to finish.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!("sandrun server listening on {}", self.config.bind_addr);
        log::info!("Run endpoint: http://{}/run", self.config.bind_addr);
        if let Some(dir) = &self.config.static_dir {
            log::info!("Serving static files from {}", dir.display());
        }

        let root = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.await;
                root.cancel();
            })
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("sandrun server shut down gracefully");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use sandrun_core::config::SandboxSettings;
    use sandrun_core::runtime::LogChunk;
    use sandrun_core::test_utils::{LogScript, MockRuntime};
    use sandrun_core::{
        ExecutionResult, IsolationProfile, SandboxError, SandboxRunner,
    };
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt; // for `oneshot`

    fn sandbox_runner(runtime: &MockRuntime) -> Arc<dyn CodeRunner> {
        let profile = IsolationProfile::from_settings(&SandboxSettings::default()).unwrap();
        Arc::new(SandboxRunner::new(
            Arc::new(runtime.clone()),
            Arc::new(profile),
            Duration::from_secs(30),
            5_000,
            1024 * 1024,
        ))
    }

    fn multipart_request(field: &str, content: &[u8]) -> Request<Body> {
        let boundary = "sandrun-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"main.c\"\r\nContent-Type: text/x-csrc\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/run")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Returns a fixed outcome without touching any runtime.
    struct ScriptedRunner {
        reason: CompletionReason,
        stdout: &'static str,
    }

    #[async_trait]
    impl CodeRunner for ScriptedRunner {
        async fn run(
            &self,
            _request: ExecutionRequest,
            cancel: CancellationToken,
        ) -> std::result::Result<ExecutionResult, SandboxError> {
            let reason = if cancel.is_cancelled() {
                CompletionReason::Canceled
            } else {
                self.reason
            };
            Ok(ExecutionResult {
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
                reason,
                truncated: false,
                elapsed: Duration::from_secs(30),
            })
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(30)
        }

        fn max_source_bytes(&self) -> u64 {
            5_000
        }
    }

    /// Blocks until its run is cancelled.
    struct BlockingRunner {
        started: Arc<Notify>,
        cancelled: Arc<Notify>,
    }

    #[async_trait]
    impl CodeRunner for BlockingRunner {
        async fn run(
            &self,
            _request: ExecutionRequest,
            cancel: CancellationToken,
        ) -> std::result::Result<ExecutionResult, SandboxError> {
            self.started.notify_one();
            cancel.cancelled().await;
            self.cancelled.notify_one();
            Err(SandboxError::Internal("canceled".into()))
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(30)
        }

        fn max_source_bytes(&self) -> u64 {
            5_000
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let runtime = MockRuntime::default();
        let app = SandrunServer::new(sandbox_runner(&runtime)).build_router();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_run_returns_captured_output() {
        let runtime = MockRuntime::new(LogScript::Exits(vec![
            LogChunk::stdout("hello"),
            LogChunk::stderr("world"),
        ]));
        let app = SandrunServer::new(sandbox_runner(&runtime)).build_router();

        let response = app
            .oneshot(multipart_request("src", b"int main(void) { return 0; }"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["stdout"], "hello");
        assert_eq!(body["stderr"], "world");
        assert_eq!(body["truncated"], false);

        let ids = runtime.created_ids();
        assert_eq!(ids.len(), 1);
        assert_eq!(runtime.remove_count(&ids[0]), 1);

        let bound = runtime.bound_profiles();
        assert!(bound[0].source_host().ends_with("main.c"));
        // The staging directory is gone once the run has finished.
        assert!(!bound[0].source_host().exists());
    }

    #[tokio::test]
    async fn test_oversize_submission_is_rejected_before_create() {
        let runtime = MockRuntime::default();
        let app = SandrunServer::new(sandbox_runner(&runtime)).build_router();

        let response = app
            .oneshot(multipart_request("src", &vec![b'x'; 5_001]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(runtime.create_count(), 0);
    }

    #[tokio::test]
    async fn test_submission_at_the_limit_is_accepted() {
        let runtime = MockRuntime::default();
        let app = SandrunServer::new(sandbox_runner(&runtime)).build_router();

        let response = app
            .oneshot(multipart_request("src", &vec![b'x'; 5_000]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(runtime.create_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_or_empty_source_is_bad_request() {
        let runtime = MockRuntime::default();
        let server = SandrunServer::new(sandbox_runner(&runtime));

        let response = server
            .build_router()
            .oneshot(multipart_request("file", b"int main;"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server
            .build_router()
            .oneshot(multipart_request("src", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(runtime.create_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_408_with_partial_output() {
        let runner = Arc::new(ScriptedRunner {
            reason: CompletionReason::TimedOut,
            stdout: "12345",
        });
        let app = SandrunServer::new(runner).build_router();

        let response = app
            .oneshot(multipart_request("src", b"int main(void) { for (;;); }"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Execution time exceeded 30sec limit");
        assert_eq!(body["stdout"], "12345");
        assert_eq!(body["stderr"], "");
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_opaque() {
        let runtime = MockRuntime::default().failing_create();
        let app = SandrunServer::new(sandbox_runner(&runtime)).build_router();

        let response = app
            .oneshot(multipart_request("src", b"int main(void) { return 0; }"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "error": "Internal Error" })
        );
        assert_eq!(runtime.start_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_runs() {
        let runner = Arc::new(ScriptedRunner {
            reason: CompletionReason::Completed,
            stdout: "",
        });
        let server = SandrunServer::new(runner);
        server.shutdown_token().cancel();

        let response = server
            .build_router()
            .oneshot(multipart_request("src", b"int main(void) { return 0; }"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_canceled_run_without_shutdown_is_a_client_close() {
        let runner = Arc::new(ScriptedRunner {
            reason: CompletionReason::Canceled,
            stdout: "",
        });
        let app = SandrunServer::new(runner).build_router();

        let response = app
            .oneshot(multipart_request("src", b"int main(void) { return 0; }"))
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 499);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_run() {
        let started = Arc::new(Notify::new());
        let cancelled = Arc::new(Notify::new());
        let runner = Arc::new(BlockingRunner {
            started: started.clone(),
            cancelled: cancelled.clone(),
        });
        let app = SandrunServer::new(runner).build_router();

        let request = tokio::spawn(
            app.oneshot(multipart_request("src", b"int main(void) { for (;;); }")),
        );
        started.notified().await;
        request.abort();

        tokio::time::timeout(Duration::from_secs(5), cancelled.notified())
            .await
            .expect("run was not cancelled after the client went away");
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>sandrun</h1>").unwrap();

        let runtime = MockRuntime::default();
        let config = ServerConfig::default().with_static_dir(dir.path());
        let app = SandrunServer::with_config(sandbox_runner(&runtime), config).build_router();

        let response = app
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<h1>sandrun</h1>");
    }
}
