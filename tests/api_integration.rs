//! Integration tests for the dashboard API endpoints.
//!
//! These tests run the full tracker (pipeline, store writer, link tasks with
//! absent devices) behind the router and verify the request/response cycle.

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;
use tokio::io::DuplexStream;

use patient_tracker::api::{AppState, router};
use patient_tracker::config::TrackerConfig;
use patient_tracker::geofence::offset_north;
use patient_tracker::model::{
    AlertEvent, AlertKind, AlertStatus, FixQuality, LocationFix, MessageStatus, OutboundMessage,
};
use patient_tracker::nmea::IngestSignal;
use patient_tracker::pipeline::BusEvent;
use patient_tracker::runtime::Tracker;
use patient_tracker::storage::Storage;

const CENTER: (f64, f64) = (12.9716, 77.5946);

fn absent_device() -> std::future::Ready<std::io::Result<DuplexStream>> {
    std::future::ready(Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no device attached",
    )))
}

/// A receiver whose device open never completes, so GPS health only moves on
/// injected fixes.
fn hanging_device() -> std::future::Pending<std::io::Result<DuplexStream>> {
    std::future::pending()
}

fn config() -> TrackerConfig {
    let mut config = TrackerConfig::default();
    config.patient_id = "P1".to_string();
    config.geofence.latitude = CENTER.0;
    config.geofence.longitude = CENTER.1;
    config.emergency_numbers = vec!["+911111111111".to_string()];
    config
}

fn fix_at(meters: f64, age: chrono::Duration) -> LocationFix {
    let (latitude, longitude) = offset_north(CENTER.0, CENTER.1, meters);
    LocationFix {
        timestamp: Utc::now() - age,
        latitude,
        longitude,
        altitude: Some(900.0),
        speed: 0.0,
        fix_quality: FixQuality::Gps,
        satellite_count: 8,
        hdop: Some(1.0),
    }
}

fn alert(id: i64, kind: AlertKind, status: AlertStatus) -> AlertEvent {
    AlertEvent {
        id,
        kind,
        message: format!("alert {id}"),
        latitude: None,
        longitude: None,
        created_at: Utc::now() - chrono::Duration::minutes(10 - id),
        resolved_at: None,
        status,
    }
}

async fn create_test_server(storage: Storage) -> (TestServer, Tracker) {
    let tracker = Tracker::start_with(&config(), storage, absent_device, absent_device)
        .await
        .unwrap();
    let server = TestServer::new(router(tracker.app_state())).unwrap();
    (server, tracker)
}

async fn send_fix(state: &AppState, fix: LocationFix) {
    let mut snapshot = state.snapshot.clone();
    state
        .bus
        .send(BusEvent::Gps(IngestSignal::Fix(fix.clone())))
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        snapshot.wait_for(|s| s.latest_fix.as_ref() == Some(&fix)),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_health_endpoint() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_current_location_not_found_without_fixes() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let response = server.get("/api/current_location").await;

    response.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_current_location_falls_back_to_history() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    storage
        .append_fix(&fix_at(30.0, chrono::Duration::hours(1)))
        .await
        .unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let response = server.get("/api/current_location").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["from_history"], true);
    assert_eq!(body["zone_status"], "unknown");
    assert_eq!(body["fix"]["satellite_count"], 8);
}

#[tokio::test]
async fn test_current_location_and_geofence_status_follow_live_fix() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let tracker = Tracker::start_with(&config(), storage, hanging_device, absent_device)
        .await
        .unwrap();
    let server = TestServer::new(router(tracker.app_state())).unwrap();

    let status: serde_json::Value = server.get("/api/geofence_status").await.json();
    assert_eq!(status["status"], "unknown");
    assert!(status["distance_m"].is_null());

    send_fix(&tracker.app_state(), fix_at(40.0, chrono::Duration::zero())).await;

    let response = server.get("/api/current_location").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["from_history"], false);
    assert_eq!(body["zone_status"], "inside");
    assert_eq!(body["gps"], "locked");

    let status: serde_json::Value = server.get("/api/geofence_status").await.json();
    assert_eq!(status["enabled"], true);
    assert_eq!(status["status"], "inside");
    assert_eq!(status["zone"]["radius_m"], 100.0);
    let distance = status["distance_m"].as_f64().unwrap();
    assert!((distance - 40.0).abs() < 0.5);
    let to_boundary = status["distance_to_boundary_m"].as_f64().unwrap();
    assert!((to_boundary - 60.0).abs() < 0.5);
}

#[tokio::test]
async fn test_location_history_window() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    storage
        .append_fix(&fix_at(10.0, chrono::Duration::hours(30)))
        .await
        .unwrap();
    storage
        .append_fix(&fix_at(20.0, chrono::Duration::hours(2)))
        .await
        .unwrap();
    storage
        .append_fix(&fix_at(30.0, chrono::Duration::hours(1)))
        .await
        .unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let fixes: Vec<LocationFix> = server.get("/api/location_history").await.json();
    assert_eq!(fixes.len(), 2);
    assert!(fixes[0].timestamp < fixes[1].timestamp);

    let fixes: Vec<LocationFix> = server
        .get("/api/location_history")
        .add_query_param("hours", 48)
        .await
        .json();
    assert_eq!(fixes.len(), 3);

    let fixes: Vec<LocationFix> = server
        .get("/api/location_history")
        .add_query_param("hours", 100000)
        .await
        .json();
    assert_eq!(fixes.len(), 3);
}

#[tokio::test]
async fn test_alerts_listing_with_messages_and_filter() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let exit = AlertKind::GeofenceExit {
        zone_id: "home".to_string(),
    };
    storage
        .append_or_update_alert(&alert(1, AlertKind::ManualSos, AlertStatus::Resolved))
        .await
        .unwrap();
    storage
        .append_or_update_alert(&alert(2, exit, AlertStatus::Open))
        .await
        .unwrap();
    storage
        .append_or_update_message(&OutboundMessage {
            id: 1,
            alert_id: 2,
            recipient: "+911111111111".to_string(),
            body: "alert 2".to_string(),
            status: MessageStatus::Sent,
            attempt_count: 1,
            last_error: None,
            next_attempt_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let all: serde_json::Value = server.get("/api/alerts").await.json();
    let all = all.as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["id"], 2);
    assert_eq!(all[0]["type"], "geofence_exit");
    assert_eq!(all[0]["zone_id"], "home");
    assert_eq!(all[0]["messages"][0]["status"], "sent");
    assert_eq!(all[1]["messages"].as_array().unwrap().len(), 0);

    let open: serde_json::Value = server
        .get("/api/alerts")
        .add_query_param("status", "open")
        .await
        .json();
    assert_eq!(open.as_array().unwrap().len(), 1);

    let response = server
        .get("/api/alerts")
        .add_query_param("status", "bogus")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_acknowledge_and_resolve_lifecycle() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    storage
        .append_or_update_alert(&alert(5, AlertKind::ManualSos, AlertStatus::Open))
        .await
        .unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let response = server
        .post("/api/acknowledge_alert")
        .json(&json!({ "alert_id": 5 }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "acknowledged");

    let response = server
        .post("/api/mark_alert_resolved")
        .json(&json!({ "alert_id": 5 }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "resolved");
    assert!(!body["resolved_at"].is_null());

    let response = server
        .post("/api/mark_alert_resolved")
        .json(&json!({ "alert_id": 5 }))
        .await;
    response.assert_status(StatusCode::CONFLICT);

    let response = server
        .post("/api/acknowledge_alert")
        .json(&json!({ "alert_id": 99 }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_resolving_alert_from_previous_run_is_conflict() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    storage
        .append_or_update_alert(&alert(3, AlertKind::DeviceOffline, AlertStatus::Resolved))
        .await
        .unwrap();
    let (server, _tracker) = create_test_server(storage).await;

    let response = server
        .post("/api/acknowledge_alert")
        .json(&json!({ "alert_id": 3 }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_state");
}

#[tokio::test]
async fn test_statistics() {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    storage
        .append_fix(&fix_at(10.0, chrono::Duration::hours(1)))
        .await
        .unwrap();
    storage
        .append_or_update_alert(&alert(1, AlertKind::ManualSos, AlertStatus::Open))
        .await
        .unwrap();
    let home = AlertKind::GeofenceEnterConfirm {
        zone_id: "home".to_string(),
    };
    storage
        .append_or_update_alert(&alert(2, home, AlertStatus::Resolved))
        .await
        .unwrap();
    let (server, tracker) = create_test_server(storage).await;

    send_fix(&tracker.app_state(), fix_at(20.0, chrono::Duration::zero())).await;

    let stats: serde_json::Value = server.get("/api/statistics").await.json();
    assert_eq!(stats["alerts_raised"], 1);
    assert_eq!(stats["alerts_active"], 1);
    assert_eq!(stats["alerts_resolved"], 0);
    assert_eq!(stats["returns_confirmed"], 1);
    assert_eq!(stats["messages_failed"], 0);
    assert_eq!(stats["records_dropped"], 0);
    assert!(stats["fixes_stored"].as_i64().unwrap() >= 1);
    assert!(!stats["last_update"].is_null());
}

#[tokio::test]
async fn test_live_fixes_are_uploaded_to_configured_server() {
    use std::sync::{Arc, Mutex};

    let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let remote = axum::Router::new().route(
        "/api/location",
        axum::routing::post({
            let received = received.clone();
            move |axum::Json(body): axum::Json<serde_json::Value>| async move {
                received.lock().unwrap().push(body);
                StatusCode::OK
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, remote).await.unwrap();
    });

    let mut config = config();
    config.server_url = Some(format!("http://{addr}/api/location"));
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let tracker = Tracker::start_with(&config, storage, hanging_device, absent_device)
        .await
        .unwrap();

    let fix = fix_at(30.0, chrono::Duration::zero());
    send_fix(&tracker.app_state(), fix.clone()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "fix was not uploaded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let body = received.lock().unwrap()[0].clone();
    assert_eq!(body["patient_id"], "P1");
    assert_eq!(body["latitude"], fix.latitude);
    assert_eq!(body["altitude"], 900.0);

    // The counter moves once the response is back
    let server = TestServer::new(router(tracker.app_state())).unwrap();
    loop {
        let stats: serde_json::Value = server.get("/api/statistics").await.json();
        if stats["fixes_uploaded"] == 1 {
            assert_eq!(stats["uploads_failed"], 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "upload was not counted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tracker.shutdown().await;
}
