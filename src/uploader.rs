//! Remote fix upload.
//!
//! When `server_url` is configured, every fix the pipeline persists is also
//! POSTed to that URL as JSON. Uploads are best effort: the pipeline offers
//! fixes with `try_send` and drops them when the queue is full, and a fix
//! that still fails after its retry budget is skipped. The local store stays
//! the record of truth.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::TrackerResult;
use crate::metrics::Metrics;
use crate::model::LocationFix;

/// Fixes waiting for upload before new ones are dropped.
pub const UPLOAD_QUEUE: usize = 32;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON body of one upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationUpload {
    pub patient_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Metres per second.
    pub speed: f64,
}

impl LocationUpload {
    pub fn new(patient_id: &str, fix: &LocationFix) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            timestamp: fix.timestamp,
            speed: fix.speed,
        }
    }
}

/// Task that posts fixes to the configured server.
pub struct Uploader {
    client: reqwest::Client,
    url: String,
    patient_id: String,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Uploader {
    pub fn new(
        url: &str,
        patient_id: &str,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> TrackerResult<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            patient_id: patient_id.to_string(),
            retry,
            metrics,
        })
    }

    /// Upload fixes until shutdown or until the pipeline drops its sender.
    pub async fn run(
        self,
        mut fixes: mpsc::Receiver<LocationFix>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let fix = tokio::select! {
                fix = fixes.recv() => match fix {
                    Some(fix) => fix,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            if !self.deliver(&fix, &mut shutdown).await {
                break;
            }
        }

        debug!("Uploader stopped");
    }

    /// Post one fix with retries. False when shutdown interrupted it.
    async fn deliver(&self, fix: &LocationFix, shutdown: &mut watch::Receiver<bool>) -> bool {
        let payload = LocationUpload::new(&self.patient_id, fix);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = tokio::select! {
                result = self.post(&payload) => result,
                _ = shutdown.changed() => return false,
            };

            let error = match result {
                Ok(()) => {
                    Metrics::incr(&self.metrics.fixes_uploaded);
                    debug!(timestamp = %payload.timestamp, "Fix uploaded");
                    return true;
                }
                Err(e) => e,
            };

            // The server refused this body; sending it again will not help
            let refused = error.status().is_some_and(|s| s.is_client_error());
            if refused || self.retry.exhausted(attempts) {
                Metrics::incr(&self.metrics.uploads_failed);
                warn!(
                    error = %error,
                    attempts,
                    timestamp = %payload.timestamp,
                    "Fix upload abandoned"
                );
                return true;
            }

            let delay = self.retry.delay_for(attempts);
            debug!(error = %error, attempt = attempts, ?delay, "Fix upload failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return false,
            }
        }
    }

    async fn post(&self, payload: &LocationUpload) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Json;
    use chrono::TimeZone;

    use crate::model::FixQuality;

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    /// Local endpoint that records every body and answers `failure` to the
    /// first `failures` requests.
    async fn collector(failures: usize, failure: StatusCode) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().route(
            "/api/location",
            post({
                let received = received.clone();
                move |Json(body): Json<serde_json::Value>| async move {
                    let mut received = received.lock().unwrap();
                    received.push(body);
                    if received.len() <= failures {
                        failure
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/api/location"), received)
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 2,
            cap: Duration::from_millis(50),
        }
    }

    fn fix(seconds: i64) -> LocationFix {
        LocationFix {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(seconds),
            latitude: 12.9716,
            longitude: 77.5946,
            altitude: Some(920.5),
            speed: 1.25,
            fix_quality: FixQuality::Gps,
            satellite_count: 9,
            hdop: Some(0.9),
        }
    }

    async fn upload_all(url: &str, fixes: Vec<LocationFix>) -> Arc<Metrics> {
        let metrics = Arc::new(Metrics::default());
        let uploader = Uploader::new(url, "P1", quick_retry(), metrics.clone()).unwrap();
        let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(uploader.run(rx, shutdown_rx));

        for fix in fixes {
            tx.send(fix).await.unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        metrics
    }

    #[tokio::test]
    async fn test_fix_is_posted_as_json() {
        let (url, received) = collector(0, StatusCode::OK).await;
        let metrics = upload_all(&url, vec![fix(0)]).await;

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        let body = &received[0];
        assert_eq!(body["patient_id"], "P1");
        assert_eq!(body["latitude"], 12.9716);
        assert_eq!(body["longitude"], 77.5946);
        assert_eq!(body["altitude"], 920.5);
        assert_eq!(body["speed"], 1.25);
        assert_eq!(body["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(Metrics::get(&metrics.fixes_uploaded), 1);
        assert_eq!(Metrics::get(&metrics.uploads_failed), 0);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let (url, received) = collector(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let metrics = upload_all(&url, vec![fix(0)]).await;

        assert_eq!(received.lock().unwrap().len(), 3);
        assert_eq!(Metrics::get(&metrics.fixes_uploaded), 1);
        assert_eq!(Metrics::get(&metrics.uploads_failed), 0);
    }

    #[tokio::test]
    async fn test_refused_fix_is_skipped_without_retry() {
        let (url, received) = collector(1, StatusCode::BAD_REQUEST).await;
        let metrics = upload_all(&url, vec![fix(0), fix(10)]).await;

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1]["timestamp"], "2024-03-01T12:00:10Z");
        assert_eq!(Metrics::get(&metrics.uploads_failed), 1);
        assert_eq!(Metrics::get(&metrics.fixes_uploaded), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up_after_budget() {
        // Bind and release a port so nothing is listening on it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let metrics = upload_all(&format!("http://{addr}/api/location"), vec![fix(0)]).await;
        assert_eq!(Metrics::get(&metrics.uploads_failed), 1);
        assert_eq!(Metrics::get(&metrics.fixes_uploaded), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retries() {
        let (url, received) = collector(usize::MAX, StatusCode::SERVICE_UNAVAILABLE).await;
        let metrics = Arc::new(Metrics::default());
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            multiplier: 1,
            cap: Duration::from_secs(30),
        };
        let uploader = Uploader::new(&url, "P1", retry, metrics.clone()).unwrap();
        let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(uploader.run(rx, shutdown_rx));

        tx.send(fix(0)).await.unwrap();
        while received.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Metrics::get(&metrics.fixes_uploaded), 0);
    }
}
