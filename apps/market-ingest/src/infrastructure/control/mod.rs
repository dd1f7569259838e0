//! Control Server
//!
//! HTTP surface for probes, metrics and operator commands.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health summary
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (control loops answer, feed not failed)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /stream/status` - supervisor snapshot
//! - `POST /stream/start`, `POST /stream/stop` - streaming switch
//! - `GET /watchlist` - watchlist snapshot
//! - `PUT /watchlist/{symbol}`, `DELETE /watchlist/{symbol}` - operator edits
//! - `DELETE /watchlist` - clear
//! - `POST /screening/run` - force a screening pass
//! - `POST /screening/pause`, `POST /screening/resume` - periodic screening

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    SchedulerHandle, ScreeningError, StreamStatus, SupervisorHandle, SupervisorUnavailable,
};
use crate::domain::market::{Symbol, SymbolError};
use crate::infrastructure::alpaca::{AlpacaBarStream, ConnectionState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Live feed state, when a live feed is wired.
    pub feed: Option<ConnectionState>,
    /// Supervisor snapshot, when the supervisor answers.
    pub streaming: Option<StreamingSummary>,
    /// Watchlist size, when the scheduler answers.
    pub watchlist_size: Option<usize>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Running, with reconnects or quarantined symbols.
    Degraded,
    /// A control loop is gone or the feed credentials were rejected.
    Unhealthy,
}

/// Condensed supervisor status.
#[derive(Debug, Clone, Serialize)]
pub struct StreamingSummary {
    /// Streaming switch.
    pub enabled: bool,
    /// Session label.
    pub session: String,
    /// Running workers.
    pub active: usize,
    /// Symbols waiting for a slot.
    pub queued: usize,
    /// Quarantined symbols.
    pub quarantined: usize,
}

impl From<&StreamStatus> for StreamingSummary {
    fn from(status: &StreamStatus) -> Self {
        Self {
            enabled: status.enabled,
            session: status.session.as_str().to_string(),
            active: status.active_count,
            queued: status.queued.len(),
            quarantined: status.quarantined.len(),
        }
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the control server.
pub struct ControlState {
    version: String,
    started_at: Instant,
    supervisor: SupervisorHandle,
    scheduler: SchedulerHandle,
    feed: Option<AlpacaBarStream>,
}

impl ControlState {
    /// Create server state over the running control loops.
    #[must_use]
    pub fn new(version: String, supervisor: SupervisorHandle, scheduler: SchedulerHandle) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            supervisor,
            scheduler,
            feed: None,
        }
    }

    /// Report the live feed in health and readiness.
    #[must_use]
    pub fn with_feed(mut self, feed: AlpacaBarStream) -> Self {
        self.feed = Some(feed);
        self
    }

    fn feed_state(&self) -> Option<ConnectionState> {
        self.feed.as_ref().map(AlpacaBarStream::connection_state)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Operator command failure, rendered as a JSON error body.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Path symbol did not parse.
    #[error(transparent)]
    InvalidSymbol(#[from] SymbolError),

    /// Symbol is not on the watchlist.
    #[error("{0} is not on the watchlist")]
    NotWatched(Symbol),

    /// A control loop is gone.
    #[error("{0}")]
    Unavailable(String),

    /// The screener failed.
    #[error("{0}")]
    Upstream(String),
}

impl From<SupervisorUnavailable> for ControlError {
    fn from(err: SupervisorUnavailable) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<ScreeningError> for ControlError {
    fn from(err: ScreeningError) -> Self {
        match err {
            ScreeningError::Screener(e) => Self::Upstream(e.to_string()),
            ScreeningError::Supervisor(e) => e.into(),
            ScreeningError::Unavailable => Self::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidSymbol(_) => StatusCode::BAD_REQUEST,
            Self::NotWatched(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Control server errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Control Server
// =============================================================================

/// Build the router over `state`.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stream/status", get(stream_status))
        .route("/stream/start", post(stream_start))
        .route("/stream/stop", post(stream_stop))
        .route("/watchlist", get(watchlist).delete(watchlist_clear))
        .route("/watchlist/{symbol}", put(watchlist_add).delete(watchlist_remove))
        .route("/screening/run", post(screening_run))
        .route("/screening/pause", post(screening_pause))
        .route("/screening/resume", post(screening_resume))
        .with_state(state)
}

/// Control HTTP server.
pub struct ControlServer {
    port: u16,
    state: Arc<ControlState>,
    cancel: CancellationToken,
}

impl ControlServer {
    /// Create a new control server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ControlState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled, then drain in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns `ControlServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ControlServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Control server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ControlServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Control server stopped");
        Ok(())
    }
}

// =============================================================================
// Probe Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;

    if response.status == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn build_health_response(state: &ControlState) -> HealthResponse {
    let (streaming, watchlist) =
        tokio::join!(state.supervisor.status(), state.scheduler.watchlist());
    let streaming = streaming.ok().map(|s| StreamingSummary::from(&s));
    let watchlist_size = watchlist.ok().map(|w| w.entries.len());
    let feed = state.feed_state();

    HealthResponse {
        status: determine_health_status(streaming.as_ref(), watchlist_size.is_some(), feed),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        streaming,
        watchlist_size,
    }
}

fn determine_health_status(
    streaming: Option<&StreamingSummary>,
    scheduler_up: bool,
    feed: Option<ConnectionState>,
) -> HealthStatus {
    let Some(streaming) = streaming else {
        return HealthStatus::Unhealthy;
    };
    if !scheduler_up || feed == Some(ConnectionState::Failed) {
        return HealthStatus::Unhealthy;
    }
    if feed == Some(ConnectionState::Reconnecting) || streaming.quarantined > 0 {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

// =============================================================================
// Operator Handlers
// =============================================================================

async fn stream_status(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    Ok(Json(state.supervisor.status().await?).into_response())
}

async fn stream_start(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    tracing::info!("Operator enabled streaming");
    Ok(Json(state.supervisor.set_enabled(true).await?).into_response())
}

async fn stream_stop(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    tracing::info!("Operator disabled streaming");
    Ok(Json(state.supervisor.set_enabled(false).await?).into_response())
}

async fn watchlist(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    Ok(Json(state.scheduler.watchlist().await?).into_response())
}

async fn watchlist_add(
    State(state): State<Arc<ControlState>>,
    Path(raw): Path<String>,
) -> Result<Response, ControlError> {
    let symbol = Symbol::parse(&raw)?;
    tracing::info!(%symbol, "Operator added symbol");
    let change = state.scheduler.add(symbol.clone()).await?;
    Ok(Json(json!({ "symbol": symbol, "added": change.added, "removed": change.removed }))
        .into_response())
}

async fn watchlist_remove(
    State(state): State<Arc<ControlState>>,
    Path(raw): Path<String>,
) -> Result<Response, ControlError> {
    let symbol = Symbol::parse(&raw)?;
    if !state.scheduler.remove(symbol.clone()).await? {
        return Err(ControlError::NotWatched(symbol));
    }
    tracing::info!(%symbol, "Operator removed symbol");
    Ok(Json(json!({ "symbol": symbol, "removed": true })).into_response())
}

async fn watchlist_clear(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    let removed = state.scheduler.clear().await?;
    tracing::info!(count = removed.len(), "Operator cleared watchlist");
    Ok(Json(json!({ "removed": removed })).into_response())
}

async fn screening_run(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    Ok(Json(state.scheduler.screen().await?).into_response())
}

async fn screening_pause(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    state.scheduler.pause().await?;
    Ok(Json(json!({ "paused": true })).into_response())
}

async fn screening_resume(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    state.scheduler.resume().await?;
    Ok(Json(json!({ "paused": false })).into_response())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::ScreenerError;
    use crate::application::services::{
        ReconcileSummary, SchedulerCommand, SupervisorCommand, WatchlistSnapshot,
    };
    use crate::domain::session::SessionState;
    use crate::domain::watchlist::WatchlistChange;

    fn status(quarantined: usize) -> StreamStatus {
        StreamStatus {
            enabled: true,
            session: SessionState::Regular,
            active_count: 0,
            active: Vec::new(),
            queued: Vec::new(),
            restarting: Vec::new(),
            quarantined: (0..quarantined)
                .map(|i| crate::application::services::FailingSymbol {
                    symbol: Symbol::parse(&format!("Q{i}")).unwrap(),
                    consecutive_failures: 3,
                })
                .collect(),
        }
    }

    fn fake_supervisor() -> SupervisorHandle {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SupervisorCommand::Status(reply) => {
                        let _ = reply.send(status(0));
                    }
                    SupervisorCommand::SetEnabled { enabled, done } => {
                        let summary = if enabled {
                            ReconcileSummary::default()
                        } else {
                            ReconcileSummary {
                                stopped: vec![Symbol::parse("AAPL").unwrap()],
                                ..ReconcileSummary::default()
                            }
                        };
                        let _ = done.send(summary);
                    }
                    SupervisorCommand::Reconcile { done, .. } => {
                        let _ = done.send(ReconcileSummary::default());
                    }
                }
            }
        });
        SupervisorHandle::new(tx)
    }

    fn fake_scheduler(screen_fails: bool) -> SchedulerHandle {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut symbols: BTreeSet<Symbol> = BTreeSet::new();
            let mut paused = false;
            while let Some(command) = rx.recv().await {
                match command {
                    SchedulerCommand::Screen(reply) => {
                        let result = if screen_fails {
                            Err(ScreeningError::Screener(ScreenerError::Request {
                                message: "connection refused".to_string(),
                            }))
                        } else {
                            Err(ScreeningError::Unavailable)
                        };
                        let _ = reply.send(result);
                    }
                    SchedulerCommand::Pause(reply) => {
                        paused = true;
                        let _ = reply.send(());
                    }
                    SchedulerCommand::Resume(reply) => {
                        paused = false;
                        let _ = reply.send(());
                    }
                    SchedulerCommand::Watchlist(reply) => {
                        let _ = reply.send(WatchlistSnapshot {
                            paused,
                            max_size: 10,
                            entries: Vec::new(),
                        });
                    }
                    SchedulerCommand::Add(symbol, reply) => {
                        let mut change = WatchlistChange::default();
                        if symbols.insert(symbol.clone()) {
                            change.added.insert(symbol);
                        }
                        let _ = reply.send(change);
                    }
                    SchedulerCommand::Remove(symbol, reply) => {
                        let _ = reply.send(symbols.remove(&symbol));
                    }
                    SchedulerCommand::Clear(reply) => {
                        let _ = reply.send(std::mem::take(&mut symbols));
                    }
                }
            }
        });
        SchedulerHandle::new(tx)
    }

    fn app(screen_fails: bool) -> Router {
        router(Arc::new(ControlState::new(
            "test".to_string(),
            fake_supervisor(),
            fake_scheduler(screen_fails),
        )))
    }

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn determine_status_rules() {
        let healthy = StreamingSummary::from(&status(0));
        let quarantined = StreamingSummary::from(&status(2));

        assert_eq!(
            determine_health_status(Some(&healthy), true, Some(ConnectionState::Streaming)),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(Some(&quarantined), true, None),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(Some(&healthy), true, Some(ConnectionState::Reconnecting)),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(Some(&healthy), true, Some(ConnectionState::Failed)),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            determine_health_status(None, true, None),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn health_reports_streaming_summary() {
        let app = app(false);
        let (status, body) = call(&app, Method::GET, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["streaming"]["session"], "regular");
        assert_eq!(body["watchlist_size"], 0);
    }

    #[tokio::test]
    async fn readyz_fails_when_supervisor_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let app = router(Arc::new(ControlState::new(
            "test".to_string(),
            SupervisorHandle::new(tx),
            fake_scheduler(false),
        )));

        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stream_stop_returns_reconcile_summary() {
        let app = app(false);
        let (status, body) = call(&app, Method::POST, "/stream/stop").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], serde_json::json!(["AAPL"]));
    }

    #[tokio::test]
    async fn watchlist_add_remove_cycle() {
        let app = app(false);

        let (status, body) = call(&app, Method::PUT, "/watchlist/aapl").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "AAPL");
        assert_eq!(body["added"], serde_json::json!(["AAPL"]));

        let (status, _) = call(&app, Method::DELETE, "/watchlist/AAPL").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::DELETE, "/watchlist/AAPL").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("AAPL"));
    }

    #[tokio::test]
    async fn invalid_symbol_is_bad_request() {
        let app = app(false);
        let (status, body) = call(&app, Method::PUT, "/watchlist/1BAD").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn screener_failure_is_bad_gateway() {
        let app = app(true);
        let (status, body) = call(&app, Method::POST, "/screening/run").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn pause_is_reflected_in_watchlist() {
        let app = app(false);

        let (status, _) = call(&app, Method::POST, "/screening/pause").await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::GET, "/watchlist").await;
        assert_eq!(body["paused"], true);
    }
}
