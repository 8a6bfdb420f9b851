//! HTTP trigger surface.
//!
//! Exposes health, status and trigger endpoints around the orchestrator.
//! At most one run is in flight per process; a trigger while a run is in
//! progress is rejected with `409`, never queued.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::emit;
use crate::error::{BindSnafu, PipelineError, ServeSnafu, ServiceError};
use crate::metrics::events::RunInProgress;
use crate::pipeline::{RunReport, run_pipeline};

/// Result label stored when a run returns an error.
pub const ERROR_RESULT: &str = "error";

/// Something that performs one complete pipeline run.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self) -> Result<RunReport, PipelineError>;
}

/// Runs the production pipeline built from a configuration.
pub struct ConfiguredRunner {
    config: Config,
}

impl ConfiguredRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineRunner for ConfiguredRunner {
    async fn run(&self) -> Result<RunReport, PipelineError> {
        run_pipeline(&self.config).await
    }
}

/// Status of the most recent run, as served by `/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatus {
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub error: Option<String>,
}

impl RunStatus {
    /// Mark a run as started unless one is already in flight.
    pub fn try_begin(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.error = None;
        true
    }

    /// Record the end of the in-flight run.
    pub fn finish(&mut self, result: &Result<RunReport, PipelineError>, at: DateTime<Utc>) {
        self.running = false;
        self.last_run = Some(at);
        match result {
            Ok(report) => {
                self.last_result = Some(report.outcome.as_str().to_string());
                self.error = None;
            }
            Err(e) => self.fail(e.to_string(), at),
        }
    }

    /// Record the end of a run that produced no result at all.
    pub fn fail(&mut self, message: String, at: DateTime<Utc>) {
        self.running = false;
        self.last_run = Some(at);
        self.last_result = Some(ERROR_RESULT.to_string());
        self.error = Some(message);
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    status: Arc<Mutex<RunStatus>>,
    runner: Arc<dyn PipelineRunner>,
}

impl AppState {
    pub fn new(runner: Arc<dyn PipelineRunner>) -> Self {
        Self {
            status: Arc::new(Mutex::new(RunStatus::default())),
            runner,
        }
    }

    pub async fn snapshot(&self) -> RunStatus {
        self.status.lock().await.clone()
    }
}

/// Build the service router. `/metrics` is mounted when a handle is given.
pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/trigger", post(trigger))
        .with_state(state);

    match metrics {
        Some(handle) => app.merge(
            Router::new()
                .route("/metrics", get(render_metrics))
                .with_state(handle),
        ),
        None => app,
    }
}

/// Serve the trigger surface on `address` until `shutdown` is cancelled.
pub async fn serve(
    address: &str,
    state: AppState,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
) -> Result<(), ServiceError> {
    let listener = TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    info!(address, "Trigger service listening");

    axum::serve(listener, router(state, metrics))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context(ServeSnafu)?;

    info!("Trigger service stopped");
    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "timestamp": timestamp()}))
}

async fn status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.snapshot().await)
}

async fn trigger(State(state): State<AppState>) -> impl IntoResponse {
    if !state.status.lock().await.try_begin() {
        warn!("Trigger rejected, a run is already in progress");
        return (
            StatusCode::CONFLICT,
            Json(json!({"detail": "Pipeline already running"})),
        );
    }

    emit!(RunInProgress { running: true });
    info!("Run triggered");
    tokio::spawn(run_in_background(state));

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "started", "timestamp": timestamp()})),
    )
}

async fn run_in_background(state: AppState) {
    // The run gets its own task so a panic surfaces as a JoinError here
    // instead of leaving `running` stuck.
    let runner = Arc::clone(&state.runner);
    let handle = tokio::spawn(async move { runner.run().await });

    match handle.await {
        Ok(result) => {
            if let Err(e) = &result {
                error!(error = %e, "Run failed");
            }
            state.status.lock().await.finish(&result, Utc::now());
        }
        Err(e) => {
            error!(error = %e, "Run task aborted");
            state.status.lock().await.fail(e.to_string(), Utc::now());
        }
    }
    emit!(RunInProgress { running: false });
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::loader::LoadOutcome;
    use crate::pipeline::RunOutcome;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Blocks until released, then returns the configured result.
    struct GatedRunner {
        release: Notify,
        fail: bool,
        panic: bool,
    }

    impl GatedRunner {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                fail,
                panic: false,
            })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                fail: false,
                panic: true,
            })
        }
    }

    #[async_trait]
    impl PipelineRunner for GatedRunner {
        async fn run(&self) -> Result<RunReport, PipelineError> {
            self.release.notified().await;
            if self.panic {
                panic!("runner blew up");
            }
            if self.fail {
                return Err(FetchError::MissingApiKey.into());
            }
            Ok(report(RunOutcome::Done))
        }
    }

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            outcome,
            resumed_from: 0,
            resumed_segments: 0,
            batches_planned: 1,
            batches_processed: 1,
            batches_failed: 0,
            api_calls: 1,
            rows_written: 3,
            items_skipped: 0,
            segments: Vec::new(),
            load: LoadOutcome::Loaded {
                rows: 3,
                version: 0,
            },
            rows_loaded: 3,
            phases: Vec::new(),
        }
    }

    async fn spawn(state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state, None)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn wait_until_idle(state: &AppState) -> RunStatus {
        for _ in 0..100 {
            let snapshot = state.snapshot().await;
            if !snapshot.running {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run did not finish");
    }

    #[test]
    fn test_status_transitions() {
        let mut status = RunStatus::default();
        assert!(status.try_begin());
        assert!(!status.try_begin());

        let at = Utc::now();
        status.finish(&Ok(report(RunOutcome::NothingLoaded)), at);
        assert!(!status.running);
        assert_eq!(status.last_run, Some(at));
        assert_eq!(status.last_result.as_deref(), Some("nothing_loaded"));

        assert!(status.try_begin());
        status.finish(&Err(FetchError::MissingApiKey.into()), at);
        assert_eq!(status.last_result.as_deref(), Some("error"));
        assert_eq!(
            status.error.as_deref(),
            Some("Fetch error: API key is not set")
        );
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let base = spawn(AppState::new(GatedRunner::new(false))).await;
        let client = reqwest::Client::new();

        for path in ["/", "/health"] {
            let response = client.get(format!("{base}{path}")).send().await.unwrap();
            assert_eq!(response.status(), 200);
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["status"], "healthy");
            assert!(body["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn test_status_has_all_fields() {
        let base = spawn(AppState::new(GatedRunner::new(false))).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["running"], false);
        for field in ["last_run", "last_result", "error"] {
            assert!(body.get(field).is_some_and(|v| v.is_null()), "{field}");
        }
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_running() {
        let runner = GatedRunner::new(false);
        let state = AppState::new(runner.clone());
        let base = spawn(state.clone()).await;
        let client = reqwest::Client::new();

        let first = client.post(format!("{base}/trigger")).send().await.unwrap();
        assert_eq!(first.status(), 202);
        let body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(body["status"], "started");

        let second = client.post(format!("{base}/trigger")).send().await.unwrap();
        assert_eq!(second.status(), 409);
        assert!(state.snapshot().await.running);

        runner.release.notify_one();
        let status = wait_until_idle(&state).await;
        assert_eq!(status.last_result.as_deref(), Some("success"));
        assert!(status.last_run.is_some());
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let runner = GatedRunner::new(true);
        let state = AppState::new(runner.clone());
        let base = spawn(state.clone()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/trigger"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);

        runner.release.notify_one();
        let status = wait_until_idle(&state).await;
        assert_eq!(status.last_result.as_deref(), Some("error"));
        assert!(status.error.is_some_and(|e| e.contains("API key")));
    }

    #[tokio::test]
    async fn test_panicking_run_releases_the_trigger() {
        let runner = GatedRunner::panicking();
        let state = AppState::new(runner.clone());
        let base = spawn(state.clone()).await;
        let client = reqwest::Client::new();

        let first = client.post(format!("{base}/trigger")).send().await.unwrap();
        assert_eq!(first.status(), 202);

        runner.release.notify_one();
        let status = wait_until_idle(&state).await;
        assert_eq!(status.last_result.as_deref(), Some("error"));
        assert!(status.last_run.is_some());
        assert!(status.error.is_some_and(|e| e.contains("panicked")));

        let second = client.post(format!("{base}/trigger")).send().await.unwrap();
        assert_eq!(second.status(), 202);
        runner.release.notify_one();
        wait_until_idle(&state).await;
    }
}
