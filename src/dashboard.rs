//! # Dashboard: Local Control Plane
//!
//! Axum server that lets a user log in, size the pool, start and stop it,
//! and watch progress. All pool work happens on the pool's own OS threads;
//! the server only reads [`SharedProgress`] snapshots and issues start/stop.
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `GET /api/stats` | Snapshot of config, pool progress and connection status |
//! | `POST /api/login` | Validate and persist the username |
//! | `POST /api/start` | Probe the coordinator, then start the pool (503 if unreachable, 409 while stopping) |
//! | `POST /api/stop` | Lower the run flag; workers are joined in the background |
//! | `POST /api/toggle` | Start if stopped, stop if running |
//! | `POST /api/slots` | Set the slot count for the next start (1..=cores) |
//! | `POST /api/test_connection` | Probe the coordinator and record the outcome |
//! | `GET /healthz` | Liveness |
//! | `GET /metrics` | Prometheus exposition |
//!
//! ## Pool Lifecycle
//!
//! ```text
//! Idle ──start──> Running ──stop──> Stopping ──workers joined──> Idle
//! ```
//!
//! A stopping pool stays in the control state until every worker has reached
//! a safe point: its snapshot keeps feeding `/api/stats`, a new start is
//! refused with 409, and the run is folded into the lifetime total in the
//! same critical section that returns the state to idle. [`run`] waits for a
//! pending drain before it returns.
//!
//! Coordinator probes block, so they run on `spawn_blocking`. The control
//! mutex is never held across an `.await`.
//!
//! [`SharedProgress`]: crate::shared::SharedProgress

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{self, ClientConfig};
use crate::coordinator::Coordinator;
use crate::error::TransportError;
use crate::lock_or_recover;
use crate::pool::{PoolConfig, PoolMode, PoolSummary, WorkerPool};
use crate::progress::format_duration;
use crate::shared::{ProgressSnapshot, SharedProgress, SlotSnapshot};
use crate::worker::WorkerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Unknown,
    Connected,
    Disconnected,
    Timeout,
    Error,
}

impl ConnectionStatus {
    pub fn from_probe(result: &Result<(), TransportError>) -> Self {
        match result {
            Ok(()) => ConnectionStatus::Connected,
            Err(TransportError::Timeout(_)) => ConnectionStatus::Timeout,
            Err(TransportError::Connection(_)) => ConnectionStatus::Disconnected,
            Err(TransportError::Status(_)) | Err(TransportError::Decode(_)) => {
                ConnectionStatus::Error
            }
        }
    }
}

/// Mutable control-plane state.
pub struct ControlState {
    pub config: ClientConfig,
    pub pool: Option<WorkerPool>,
    /// Progress of a pool that was told to stop and is still draining.
    pub stopping: Option<Arc<SharedProgress>>,
    drain: Option<tokio::task::JoinHandle<()>>,
    pub connection: ConnectionStatus,
    pub last_error: Option<String>,
}

impl ControlState {
    /// Snapshot of the running pool, or of the one still draining.
    pub fn live_snapshot(&self) -> Option<ProgressSnapshot> {
        match (&self.pool, &self.stopping) {
            (Some(pool), _) => Some(pool.shared().snapshot()),
            (None, Some(shared)) => Some(shared.snapshot()),
            (None, None) => None,
        }
    }
}

pub struct AppState {
    pub control: Mutex<ControlState>,
    pub coordinator: Arc<dyn Coordinator>,
    /// Where config changes are persisted; `None` keeps them in memory.
    pub config_path: Option<PathBuf>,
    pub metrics: crate::prom_metrics::Metrics,
    pub max_slots: usize,
    pub mode: PoolMode,
    /// Template for every pool start; `user_id` is replaced by the login.
    pub worker_settings: WorkerSettings,
}

impl AppState {
    pub fn new(
        config: ClientConfig,
        coordinator: Arc<dyn Coordinator>,
        config_path: Option<PathBuf>,
        mode: PoolMode,
        worker_settings: WorkerSettings,
    ) -> Arc<Self> {
        Arc::new(AppState {
            control: Mutex::new(ControlState {
                config,
                pool: None,
                stopping: None,
                drain: None,
                connection: ConnectionStatus::Unknown,
                last_error: None,
            }),
            coordinator,
            config_path,
            metrics: crate::prom_metrics::Metrics::new(),
            max_slots: config::available_cores(),
            mode,
            worker_settings,
        })
    }

    fn persist(&self, config: &ClientConfig) -> Option<String> {
        let path = self.config_path.as_ref()?;
        match config.save(path) {
            Ok(()) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to save config");
                Some(format!("failed to save config: {}", e))
            }
        }
    }

    /// Fold a finished run into the lifetime total, persist it and leave
    /// the stopping state.
    fn record_run(&self, summary: &PoolSummary) {
        let mut control = lock_or_recover(&self.control);
        control.stopping = None;
        control.config.tasks_completed += summary.tasks_completed;
        let config = control.config.clone();
        if let Some(err) = self.persist(&config) {
            control.last_error = Some(err);
        }
    }
}

fn json_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}

fn json_status(status: &str) -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": status }))).into_response()
}

// ── Coordinator Probe ──────────────────────────────────────────────

async fn probe(state: &Arc<AppState>) -> Result<(), TransportError> {
    let coordinator = Arc::clone(&state.coordinator);
    let result = tokio::task::spawn_blocking(move || coordinator.ping())
        .await
        .unwrap_or_else(|e| Err(TransportError::Connection(e.to_string())));
    let mut control = lock_or_recover(&state.control);
    control.connection = ConnectionStatus::from_probe(&result);
    control.last_error = result.as_ref().err().map(|e| e.to_string());
    result
}

#[derive(Serialize)]
pub struct ConnectionResponse {
    pub connected: bool,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
}

async fn handler_test_connection(State(state): State<Arc<AppState>>) -> Json<ConnectionResponse> {
    let result = probe(&state).await;
    Json(ConnectionResponse {
        connected: result.is_ok(),
        connection_status: ConnectionStatus::from_probe(&result),
        last_error: result.err().map(|e| e.to_string()),
    })
}

// ── Pool Lifecycle ─────────────────────────────────────────────────

fn still_stopping() -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({
            "status": "stopping",
            "error": "previous run is still stopping",
        })),
    )
        .into_response()
}

fn precheck_start(state: &AppState) -> Option<Response> {
    let control = lock_or_recover(&state.control);
    if control.pool.is_some() {
        return Some(json_status("running"));
    }
    if control.stopping.is_some() {
        return Some(still_stopping());
    }
    if control.config.username.is_none() {
        return Some(json_error(StatusCode::BAD_REQUEST, "login required"));
    }
    None
}

fn launch(state: &AppState) -> Response {
    let mut control = lock_or_recover(&state.control);
    if control.pool.is_some() {
        return json_status("running");
    }
    if control.stopping.is_some() {
        return still_stopping();
    }
    let Some(user_id) = control.config.username.clone() else {
        return json_error(StatusCode::BAD_REQUEST, "login required");
    };
    let slots = control.config.slots.clamp(1, state.max_slots.max(1));
    let config = PoolConfig {
        slots,
        mode: state.mode,
        settings: WorkerSettings {
            user_id,
            ..state.worker_settings.clone()
        },
    };
    match WorkerPool::start(config, Arc::clone(&state.coordinator)) {
        Ok(pool) => {
            control.pool = Some(pool);
            info!(slots, "pool started from dashboard");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": "started", "slots": slots })),
            )
                .into_response()
        }
        Err(e) => {
            control.last_error = Some(e.to_string());
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn start_pool(state: &Arc<AppState>) -> Response {
    if let Some(resp) = precheck_start(state) {
        return resp;
    }
    if let Err(e) = probe(state).await {
        warn!(error = %e, "refusing to start, coordinator unreachable");
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("coordinator unreachable: {}", e),
        );
    }
    launch(state)
}

/// Lower the run flag and join the workers off the request path. The pool
/// stays visible as stopping until the join completes.
fn stop_pool(state: &Arc<AppState>) -> Response {
    let mut control = lock_or_recover(&state.control);
    if control.stopping.is_some() {
        return json_status("stopping");
    }
    let Some(pool) = control.pool.take() else {
        return json_status("stopped");
    };
    pool.request_shutdown();
    control.stopping = Some(pool.shared());
    let bg = Arc::clone(state);
    control.drain = Some(tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || pool.join()).await {
            Ok(summary) => bg.record_run(&summary),
            Err(e) => {
                warn!(error = %e, "joining worker pool failed");
                lock_or_recover(&bg.control).stopping = None;
            }
        }
    }));
    json_status("stopping")
}

async fn handler_start(State(state): State<Arc<AppState>>) -> Response {
    start_pool(&state).await
}

async fn handler_stop(State(state): State<Arc<AppState>>) -> Response {
    stop_pool(&state)
}

async fn handler_toggle(State(state): State<Arc<AppState>>) -> Response {
    let busy = {
        let control = lock_or_recover(&state.control);
        control.pool.is_some() || control.stopping.is_some()
    };
    if busy {
        stop_pool(&state)
    } else {
        start_pool(&state).await
    }
}

// ── Configuration ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

async fn handler_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let username = req.username.trim().to_string();
    if let Err(e) = config::validate_username(&username) {
        return json_error(StatusCode::BAD_REQUEST, e.to_string());
    }
    let mut control = lock_or_recover(&state.control);
    control.config.username = Some(username.clone());
    let config = control.config.clone();
    if let Some(err) = state.persist(&config) {
        control.last_error = Some(err);
    }
    (StatusCode::OK, Json(serde_json::json!({ "username": username }))).into_response()
}

#[derive(Deserialize)]
pub struct SlotsRequest {
    pub slots: usize,
}

async fn handler_slots(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SlotsRequest>,
) -> Response {
    if req.slots < 1 || req.slots > state.max_slots {
        return json_error(
            StatusCode::BAD_REQUEST,
            format!("slots must be between 1 and {}", state.max_slots),
        );
    }
    let mut control = lock_or_recover(&state.control);
    control.config.slots = req.slots;
    let config = control.config.clone();
    if let Some(err) = state.persist(&config) {
        control.last_error = Some(err);
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({ "slots": req.slots, "applies_on_next_start": control.pool.is_some() })),
    )
        .into_response()
}

// ── Stats ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatsResponse {
    pub username: Option<String>,
    pub is_running: bool,
    /// Stop requested, workers still finishing their current step.
    pub is_stopping: bool,
    /// Lifetime total, including the current run.
    pub tasks_completed: u64,
    pub primes_found: u64,
    pub current_tasks: Vec<String>,
    /// Tasks per hour in the current run.
    pub processing_speed: f64,
    pub running_time: String,
    pub slots: usize,
    pub max_slots: usize,
    pub mode: PoolMode,
    pub slot_status: Vec<SlotSnapshot>,
    pub error_count: u64,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
}

async fn handler_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let control = lock_or_recover(&state.control);
    let snapshot = control.live_snapshot();
    let run_completed = snapshot.as_ref().map(|s| s.tasks_completed).unwrap_or(0);
    Json(StatsResponse {
        username: control.config.username.clone(),
        is_running: snapshot.as_ref().map(|s| s.running).unwrap_or(false),
        is_stopping: control.stopping.is_some(),
        tasks_completed: control.config.tasks_completed + run_completed,
        primes_found: snapshot.as_ref().map(|s| s.primes_found).unwrap_or(0),
        current_tasks: snapshot
            .as_ref()
            .map(|s| {
                s.slots
                    .iter()
                    .filter_map(|slot| slot.label.clone())
                    .collect()
            })
            .unwrap_or_default(),
        processing_speed: snapshot.as_ref().map(|s| s.tasks_per_hour).unwrap_or(0.0),
        running_time: format_duration(snapshot.as_ref().map(|s| s.elapsed_secs).unwrap_or(0)),
        slots: control.config.slots,
        max_slots: state.max_slots,
        mode: state.mode,
        error_count: snapshot.as_ref().map(|s| s.total_slot_errors()).unwrap_or(0),
        slot_status: snapshot.map(|s| s.slots).unwrap_or_default(),
        connection_status: control.connection,
        last_error: control.last_error.clone(),
    })
}

// ── Health & Metrics ───────────────────────────────────────────────

async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = lock_or_recover(&state.control).live_snapshot();
    state.metrics.observe(snapshot.as_ref());
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.encode(),
    )
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stats", get(handler_stats))
        .route("/api/login", post(handler_login))
        .route("/api/start", post(handler_start))
        .route("/api/stop", post(handler_stop))
        .route("/api/toggle", post(handler_toggle))
        .route("/api/slots", post(handler_slots))
        .route("/api/test_connection", post(handler_test_connection))
        .route("/healthz", get(handler_healthz))
        .route("/metrics", get(handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the dashboard on `127.0.0.1:port` until Ctrl-C/SIGTERM, then stop
/// any running pool and wait for its workers, including a pool that was
/// already draining.
pub async fn run(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = build_router(Arc::clone(&state));
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "dashboard running");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let drain = lock_or_recover(&state.control).drain.take();
    if let Some(drain) = drain {
        info!("waiting for stopping worker pool");
        if let Err(e) = drain.await {
            warn!(error = %e, "drain task failed");
        }
    }
    let pool = lock_or_recover(&state.control).pool.take();
    if let Some(pool) = pool {
        info!("stopping worker pool");
        let summary = tokio::task::spawn_blocking(move || pool.shutdown()).await?;
        state.record_run(&summary);
    }
    info!("dashboard shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
