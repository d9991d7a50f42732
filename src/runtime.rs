//! Task wiring, startup recovery and shutdown.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerting::{AlertManager, AlertSettings};
use crate::api::AppState;
use crate::config::{RetryPolicy, TrackerConfig};
use crate::error::TrackerResult;
use crate::geofence::GeofenceEvaluator;
use crate::gsm::{GsmLink, GsmSettings};
use crate::metrics::Metrics;
use crate::model::SystemSnapshot;
use crate::nmea::{GpsDecoder, GpsIngest};
use crate::pipeline::{BusEvent, Pipeline};
use crate::serial::open_device;
use crate::sos::SosInput;
use crate::storage::{Storage, StoreWriter};
use crate::uploader::{UPLOAD_QUEUE, Uploader};

const BUS_CAPACITY: usize = 256;
const STORE_CAPACITY: usize = 256;

/// Running tracker tasks.
pub struct Tracker {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    /// Awaited in this order at shutdown; producers first, store writer last.
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    drain: Duration,
}

impl Tracker {
    /// Start the tracker on the configured serial devices.
    pub async fn start(config: &TrackerConfig, storage: Storage) -> TrackerResult<Self> {
        let gps_port = config.gps_port.clone();
        let gsm_port = config.gsm_port.clone();
        Self::start_with(
            config,
            storage,
            move || open_device_owned(gps_port.clone()),
            move || open_device_owned(gsm_port.clone()),
        )
        .await
    }

    /// Start the tracker with custom GPS and modem connectors.
    pub async fn start_with<G, GFut, GS, M, MFut, MS>(
        config: &TrackerConfig,
        storage: Storage,
        gps_connect: G,
        gsm_connect: M,
    ) -> TrackerResult<Self>
    where
        G: FnMut() -> GFut + Send + 'static,
        GFut: Future<Output = std::io::Result<GS>> + Send + 'static,
        GS: AsyncRead + Unpin + Send + 'static,
        M: FnMut() -> MFut + Send + 'static,
        MFut: Future<Output = std::io::Result<MS>> + Send + 'static,
        MS: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let metrics = Arc::new(Metrics::default());
        let now = Utc::now();

        let recovered = storage.recover_interrupted_sends().await?;
        if recovered > 0 {
            warn!(count = recovered, "Messages interrupted mid-send returned to the queue");
        }
        let (max_alert, max_message) = storage.max_ids().await?;
        let active = storage.active_alerts().await?;
        let pending = storage.pending_messages().await?;
        let last_fix = storage.latest_fix().await?;
        info!(
            active_alerts = active.len(),
            pending_messages = pending.len(),
            "Restored state from store"
        );

        let zone = config.zone();
        let mut alerts = AlertManager::new(
            AlertSettings {
                patient_id: config.patient_id.clone(),
                recipients: config.emergency_numbers.clone(),
                confirm_fixes: config.alert_confirm_fixes,
                offline_after: Duration::from_secs(config.device_offline_seconds),
                notify_on_return: config.notify_on_return,
            },
            (max_alert + 1, max_message + 1),
            now,
        );
        alerts.restore(active);
        alerts.set_last_fix(last_fix);

        let uploader = match &config.server_url {
            Some(url) => {
                info!(url = %url, "Fix upload enabled");
                Some(Uploader::new(
                    url,
                    &config.patient_id,
                    RetryPolicy::upload(),
                    metrics.clone(),
                )?)
            }
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (bus_tx, bus_rx) = mpsc::channel(BUS_CAPACITY);
        let (store_tx, store_rx) = mpsc::channel(STORE_CAPACITY);
        // Unbounded so the pipeline never waits on the modem, which itself
        // reports to the pipeline. Alert dedupe bounds its depth.
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SystemSnapshot::initial(None));

        let mut tasks = Vec::new();

        if let Some(path) = &config.sos_input {
            let sos = SosInput::new(path.clone(), Duration::from_millis(config.sos_poll_millis));
            tasks.push((
                "sos",
                tokio::spawn(sos.run(bus_tx.clone(), shutdown_rx.clone())),
            ));
        }

        let decoder = GpsDecoder::new(
            config.max_plausible_speed_mps,
            Duration::from_secs(config.gps_stale_seconds),
            metrics.clone(),
        );
        let ingest = GpsIngest::new(decoder, RetryPolicy::link());
        tasks.push((
            "gps",
            tokio::spawn(ingest.run(gps_connect, bus_tx.clone(), shutdown_rx.clone())),
        ));

        let mut link = GsmLink::new(
            GsmSettings {
                command_timeout: Duration::from_secs(5),
                sms_timeout: Duration::from_secs(config.sms_timeout_seconds),
                probe_interval: Duration::from_secs(config.gsm_probe_seconds),
                sms_retry: config.sms_retry_policy(),
                link_retry: RetryPolicy::link(),
            },
            metrics.clone(),
        );
        link.restore(pending);
        tasks.push((
            "gsm",
            tokio::spawn(link.run(gsm_connect, outbound_rx, bus_tx.clone(), shutdown_rx.clone())),
        ));

        let mut pipeline = Pipeline::new(
            GeofenceEvaluator::new(zone.clone()),
            alerts,
            snapshot_tx,
            store_tx,
            outbound_tx,
            storage.clone(),
            config.update_interval(),
        );
        let mut uploads = None;
        if let Some(uploader) = uploader {
            let (upload_tx, upload_rx) = mpsc::channel(UPLOAD_QUEUE);
            pipeline = pipeline.with_uploads(upload_tx);
            uploads = Some(tokio::spawn(uploader.run(upload_rx, shutdown_rx.clone())));
        }
        tasks.push((
            "pipeline",
            tokio::spawn(pipeline.run(bus_rx, shutdown_rx.clone())),
        ));
        if let Some(handle) = uploads {
            tasks.push(("uploader", handle));
        }

        let writer = StoreWriter::new(
            storage.clone(),
            config.persistence_backlog,
            RetryPolicy::persistence(),
            metrics.clone(),
            config.retention(),
        );
        tasks.push(("store", tokio::spawn(writer.run(store_rx))));

        info!(
            patient_id = %config.patient_id,
            zone_id = %zone.id,
            radius_m = zone.radius_m,
            recipients = config.emergency_numbers.len(),
            "Tracker started"
        );

        Ok(Self {
            state: AppState {
                storage,
                snapshot: snapshot_rx,
                bus: bus_tx,
                metrics,
                zone,
            },
            shutdown_tx,
            tasks,
            drain: Duration::from_secs(config.shutdown_drain_seconds),
        })
    }

    /// Shared state for the dashboard router.
    pub fn app_state(&self) -> AppState {
        self.state.clone()
    }

    pub fn bus(&self) -> mpsc::Sender<BusEvent> {
        self.state.bus.clone()
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every task to stop and wait for them, aborting stragglers.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.shutdown_tx.send_replace(true);
        drop(self.state);

        let deadline = tokio::time::Instant::now() + self.drain;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("Shutdown complete");
    }
}

async fn open_device_owned(path: PathBuf) -> std::io::Result<tokio::fs::File> {
    open_device(&path).await
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
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
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Reload `emergency_numbers` from the configuration file on SIGHUP.
///
/// Only the recipient list is reloaded; other options need a restart.
#[cfg(unix)]
pub fn spawn_reload_listener(
    config_path: PathBuf,
    bus: mpsc::Sender<BusEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGHUP, reload disabled");
                    return;
                }
            };

        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }

            match TrackerConfig::load(&config_path) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Configuration reloaded");
                    if bus
                        .send(BusEvent::RecipientsChanged(config.emergency_numbers))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Reload rejected, keeping current recipients"),
            }
        }
    })
}
