//! Patient Tracker - single-patient GPS tracking with geofence alerts over SMS.
//!
//! # Environment
//!
//! - `TRACKER_CONFIG` - JSON configuration file (default: `config.json`)
//! - `TRACKER_PORT` - Dashboard port (default: 5000)
//! - `TRACKER_DATABASE_URL` - SQLite connection string
//!
//! # API Endpoints
//!
//! - `GET /api/current_location` - Latest fix and zone status
//! - `GET /api/location_history` - Stored fixes
//! - `GET /api/alerts` - Alerts with their SMS
//! - `POST /api/mark_alert_resolved` - Resolve an alert
//! - `POST /api/acknowledge_alert` - Acknowledge an alert
//! - `GET /api/geofence_status` - Zone and distance
//! - `GET /api/statistics` - Counters
//! - `GET /health` - Health check

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use patient_tracker::api::router;
use patient_tracker::config::TrackerConfig;
use patient_tracker::runtime::{Tracker, shutdown_signal};
use patient_tracker::storage::Storage;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 5000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:patient_tracking.db?mode=rwc";

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("patient_tracker=info".parse()?))
        .init();

    let config_path =
        PathBuf::from(env::var("TRACKER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()));

    let port: u16 = env::var("TRACKER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("TRACKER_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let config = match TrackerConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Invalid configuration, refusing to start");
            return Err(e.into());
        }
    };

    info!(
        port,
        db_url = %db_url,
        gps_port = %config.gps_port.display(),
        gsm_port = %config.gsm_port.display(),
        "Starting patient tracker"
    );

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let tracker = Tracker::start(&config, storage).await?;

    #[cfg(unix)]
    patient_tracker::runtime::spawn_reload_listener(
        config_path.clone(),
        tracker.bus(),
        tracker.shutdown_receiver(),
    );

    let app = router(tracker.app_state());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Dashboard is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracker.shutdown().await;

    Ok(())
}
