//! HTTP API handlers for the caregiver dashboard.
//!
//! The API is a read projection over the live [`SystemSnapshot`] and the
//! store. The only mutations are the alert acknowledge/resolve commands,
//! which are forwarded to the pipeline task so that the alert lifecycle has a
//! single writer.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::error::TrackerError;
use crate::metrics::Metrics;
use crate::model::{
    AlertActionRequest, AlertEvent, AlertWithMessages, AlertsQuery, CurrentLocationResponse,
    GeofenceStatusResponse, GeofenceZone, HistoryQuery, LocationFix, StatisticsResponse,
    SystemSnapshot,
};
use crate::pipeline::{AlertAction, BusEvent, send_command};
use crate::storage::Storage;

/// Largest history window served, one year.
pub const MAX_HISTORY_HOURS: u32 = 8760;

/// Alerts returned by GET /api/alerts.
pub const ALERT_LIST_LIMIT: i64 = 50;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub snapshot: watch::Receiver<SystemSnapshot>,
    pub bus: mpsc::Sender<BusEvent>,
    pub metrics: Arc<Metrics>,
    pub zone: GeofenceZone,
}

/// Errors returned to dashboard clients.
#[derive(Debug)]
pub enum ApiError {
    /// 404
    NotFound(String),
    /// 409
    InvalidState(String),
    /// 503
    Unavailable(String),
    /// 500
    Internal(String),
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            TrackerError::InvalidTransition { .. } => ApiError::InvalidState(err.to_string()),
            TrackerError::ChannelClosed(_) => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::InvalidState(m) => (StatusCode::CONFLICT, "invalid_state", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", m),
        };

        if status.is_server_error() {
            warn!(code, error = %message, "Request failed");
        }

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

/// Build the dashboard router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/current_location", get(get_current_location))
        .route("/api/location_history", get(get_location_history))
        .route("/api/alerts", get(get_alerts))
        .route("/api/mark_alert_resolved", post(post_mark_alert_resolved))
        .route("/api/acknowledge_alert", post(post_acknowledge_alert))
        .route("/api/geofence_status", get(get_geofence_status))
        .route("/api/statistics", get(get_statistics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /api/current_location - Latest fix with zone status and GPS health.
///
/// Falls back to the last stored fix (with `from_history: true`) when no fix
/// has arrived since startup; 404 when there is none at all.
#[instrument(skip(state))]
pub async fn get_current_location(
    State(state): State<AppState>,
) -> Result<Json<CurrentLocationResponse>, ApiError> {
    let snapshot = state.snapshot.borrow().clone();

    let (fix, from_history) = match snapshot.latest_fix {
        Some(fix) => (fix, false),
        None => match state.storage.latest_fix().await? {
            Some(fix) => (fix, true),
            None => return Err(ApiError::NotFound("No location available yet".to_string())),
        },
    };

    Ok(Json(CurrentLocationResponse {
        fix,
        zone_status: snapshot.zone_state,
        gps: snapshot.gps,
        from_history,
    }))
}

/// GET /api/location_history - Stored fixes in the last `hours`, oldest first.
///
/// # Query Parameters
///
/// - `hours` (optional): Lookback window (default: 24, at most one year)
#[instrument(skip(state))]
pub async fn get_location_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<LocationFix>>, ApiError> {
    let hours = query.hours.min(MAX_HISTORY_HOURS);
    let now = Utc::now();
    let from = now - chrono::Duration::hours(i64::from(hours));

    let fixes = state.storage.fixes_in_window(from, now).await?;
    info!(hours, count = fixes.len(), "Location history queried");
    Ok(Json(fixes))
}

/// GET /api/alerts - Recent alerts with their messages, newest first.
///
/// # Query Parameters
///
/// - `status` (optional): `open`, `acknowledged` or `resolved`
#[instrument(skip(state))]
pub async fn get_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<AlertWithMessages>>, ApiError> {
    let alerts = state
        .storage
        .alerts_by_status(query.status, ALERT_LIST_LIMIT)
        .await?;

    let mut response = Vec::with_capacity(alerts.len());
    for alert in alerts {
        let messages = state.storage.messages_by_alert(alert.id).await?;
        response.push(AlertWithMessages { alert, messages });
    }

    info!(count = response.len(), status = ?query.status, "Alerts queried");
    Ok(Json(response))
}

/// POST /api/mark_alert_resolved - Resolve an open or acknowledged alert.
///
/// ```json
/// { "alert_id": 3 }
/// ```
#[instrument(skip(state))]
pub async fn post_mark_alert_resolved(
    State(state): State<AppState>,
    Json(request): Json<AlertActionRequest>,
) -> Result<Json<AlertEvent>, ApiError> {
    let alert = send_command(&state.bus, AlertAction::Resolve, request.alert_id).await?;
    Ok(Json(alert))
}

/// POST /api/acknowledge_alert - Acknowledge an open alert.
#[instrument(skip(state))]
pub async fn post_acknowledge_alert(
    State(state): State<AppState>,
    Json(request): Json<AlertActionRequest>,
) -> Result<Json<AlertEvent>, ApiError> {
    let alert = send_command(&state.bus, AlertAction::Acknowledge, request.alert_id).await?;
    Ok(Json(alert))
}

/// GET /api/geofence_status - Zone definition and the patient's position relative to it.
#[instrument(skip(state))]
pub async fn get_geofence_status(State(state): State<AppState>) -> Json<GeofenceStatusResponse> {
    let snapshot = state.snapshot.borrow().clone();
    let distance_to_boundary_m = snapshot.distance_m.map(|d| state.zone.radius_m - d);

    Json(GeofenceStatusResponse {
        enabled: state.zone.enabled,
        zone: state.zone.clone(),
        status: snapshot.zone_state,
        distance_m: snapshot.distance_m,
        distance_to_boundary_m,
    })
}

/// GET /api/statistics - Counters for fixes, alerts, messages and parse errors.
#[instrument(skip(state))]
pub async fn get_statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsResponse>, ApiError> {
    let counts = state.storage.counts().await?;
    let live_update = state.snapshot.borrow().latest_fix.as_ref().map(|f| f.timestamp);
    let metrics = &state.metrics;

    Ok(Json(StatisticsResponse {
        fixes_received: Metrics::get(&metrics.fixes_received),
        fixes_stored: counts.fixes,
        fixes_rejected: Metrics::get(&metrics.fixes_rejected),
        sentences_bad_checksum: Metrics::get(&metrics.sentences_bad_checksum),
        sentences_ignored: Metrics::get(&metrics.sentences_ignored),
        alerts_raised: counts.alerts_raised,
        alerts_resolved: counts.alerts_resolved,
        alerts_active: counts.alerts_active,
        returns_confirmed: counts.returns_confirmed,
        messages_sent: counts.messages_sent,
        messages_failed: counts.messages_failed,
        records_dropped: Metrics::get(&metrics.records_dropped),
        fixes_uploaded: Metrics::get(&metrics.fixes_uploaded),
        uploads_failed: Metrics::get(&metrics.uploads_failed),
        last_update: live_update.max(counts.last_fix_at),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_error_mapping() {
        let not_found: ApiError = TrackerError::NotFound {
            resource: "alert",
            id: 9,
        }
        .into();
        let response = not_found.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "alert 9 not found");

        let conflict: ApiError = TrackerError::InvalidTransition {
            id: 1,
            from: "resolved".into(),
            to: "acknowledged".into(),
        }
        .into();
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let closed: ApiError = TrackerError::ChannelClosed("pipeline").into();
        assert_eq!(closed.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn test_state() -> (AppState, watch::Sender<SystemSnapshot>, mpsc::Receiver<BusEvent>) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let (snapshot_tx, snapshot) = watch::channel(SystemSnapshot::initial(None));
        let (bus, bus_rx) = mpsc::channel(4);
        let zone = GeofenceZone {
            id: "home".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            radius_m: 100.0,
            hysteresis_fraction: 0.05,
            enabled: true,
        };
        let state = AppState {
            storage,
            snapshot,
            bus,
            metrics: Arc::new(Metrics::default()),
            zone,
        };
        (state, snapshot_tx, bus_rx)
    }

    #[tokio::test]
    async fn test_geofence_status_reports_boundary_distance() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let (state, snapshot_tx, _bus_rx) = test_state().await;
        snapshot_tx.send_modify(|s| {
            s.zone_state = crate::model::ZoneState::Outside;
            s.distance_m = Some(130.0);
        });

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/geofence_status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "outside");
        assert_eq!(body["distance_to_boundary_m"], -30.0);
    }

    #[tokio::test]
    async fn test_command_without_pipeline_is_unavailable() {
        use axum::body::Body;
        use axum::http::{Request, header};
        use tower::ServiceExt;

        let (state, _snapshot_tx, bus_rx) = test_state().await;
        drop(bus_rx);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/acknowledge_alert")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"alert_id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
