//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::replication::{
    BandwidthSample, BandwidthStats, CorrectionRecord, Event, EventFilter, EventKind,
    InspectorSummary, Replay,
};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Corrections returned alongside the inspector summary
const RECENT_CORRECTIONS: usize = 20;

/// Upper bound on how long a diagnostics request may take
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/stats/bandwidth", get(bandwidth_handler))
        .route("/stats/inspector", get(inspector_handler))
        .route("/events", get(events_handler))
        .route("/events/export", get(export_events_handler))
        .route("/replay", get(replay_handler))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(state.config.client_origin.as_deref()))
        .with_state(state)
}

/// CORS from CLIENT_ORIGIN (comma-separated); any origin when unset
fn cors_layer(client_origin: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    match client_origin {
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
                .collect();
            base.allow_origin(allowed_origins)
        }
        None => base.allow_origin(Any),
    }
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    tick: u64,
    tick_rate: u32,
    connections: usize,
    max_connections: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        tick: state.services.current_tick(),
        tick_rate: state.services.tick_rate(),
        connections: state.pool.len(),
        max_connections: state.pool.max_connections(),
    })
}

// ============================================================================
// Diagnostics endpoints
// ============================================================================

#[derive(Serialize)]
struct BandwidthResponse {
    stats: BandwidthStats,
    samples: Vec<BandwidthSample>,
}

async fn bandwidth_handler(State(state): State<AppState>) -> Json<BandwidthResponse> {
    let bandwidth = state.services.bandwidth.lock();
    Json(BandwidthResponse {
        stats: bandwidth.get_stats(),
        samples: bandwidth.samples().cloned().collect(),
    })
}

#[derive(Serialize)]
struct InspectorResponse {
    summary: InspectorSummary,
    recent_corrections: Vec<CorrectionRecord>,
}

async fn inspector_handler(State(state): State<AppState>) -> Json<InspectorResponse> {
    let inspector = state.services.inspector.lock();
    let retained = inspector.corrections().count();
    let recent: Vec<CorrectionRecord> = inspector
        .corrections()
        .skip(retained.saturating_sub(RECENT_CORRECTIONS))
        .cloned()
        .collect();

    Json(InspectorResponse {
        summary: inspector.summary(),
        recent_corrections: recent,
    })
}

// ============================================================================
// Event log endpoints
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct EventQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    tick: Option<u64>,
    from: Option<u64>,
    to: Option<u64>,
    actor: Option<String>,
    entity: Option<String>,
    app: Option<String>,
}

impl EventQuery {
    fn into_filter(self) -> Result<EventFilter, AppError> {
        let mut filter = EventFilter::default();
        if let Some(kind) = self.kind {
            filter = filter.kind(EventKind::from(kind));
        }
        if let Some(tick) = self.tick {
            filter = filter.tick(tick);
        }
        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => {
                return Err(AppError::BadRequest(format!(
                    "from ({from}) is after to ({to})"
                )));
            }
            (None, None) => {}
            (from, to) => {
                filter = filter.tick_range(from.unwrap_or(0), to.unwrap_or(u64::MAX));
            }
        }
        if let Some(actor) = self.actor {
            filter = filter.actor(actor);
        }
        if let Some(entity) = self.entity {
            filter = filter.entity(entity);
        }
        if let Some(app) = self.app {
            filter = filter.app(app);
        }
        Ok(filter)
    }
}

async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<Vec<Event>>, AppError> {
    let filter = query.into_filter()?;
    let log = state.services.event_log.lock();
    let events = log.query(&filter).into_iter().cloned().collect();
    Ok(Json(events))
}

async fn export_events_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    let body = state
        .services
        .event_log
        .lock()
        .serialize()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

// ============================================================================
// Recording endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReplayQuery {
    start: Option<u64>,
    end: Option<u64>,
}

async fn replay_handler(
    State(state): State<AppState>,
    Query(query): Query<ReplayQuery>,
) -> Result<Json<Replay>, AppError> {
    let start = query.start.unwrap_or(0);
    let end = query.end.unwrap_or(u64::MAX);
    if start > end {
        return Err(AppError::BadRequest(format!(
            "start ({start}) is after end ({end})"
        )));
    }

    Ok(Json(state.services.recording.lock().get_replay(start, end)))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
