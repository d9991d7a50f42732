//! Event bus and the pipeline task.
//!
//! Producers (GPS ingest, GSM link, SOS input, dashboard commands) send
//! [`BusEvent`]s over one bounded channel. The [`Pipeline`] task is the only
//! owner of the live state, the geofence evaluator and the alert manager; it
//! publishes a [`SystemSnapshot`] over a `watch` channel after every change
//! and forwards records to the store writer and messages to the GSM link.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::alerting::{AlertManager, AlertOutcome};
use crate::error::{TrackerError, TrackerResult};
use crate::geofence::GeofenceEvaluator;
use crate::gsm::GsmEvent;
use crate::model::{
    AlertEvent, AlertStatus, GpsHealth, LinkState, LocationFix, OutboundMessage, SystemSnapshot,
};
use crate::nmea::IngestSignal;
use crate::storage::{Storage, StoreRecord};

/// Dashboard command on an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    Acknowledge,
    Resolve,
}

impl AlertAction {
    fn target(&self) -> AlertStatus {
        match self {
            AlertAction::Acknowledge => AlertStatus::Acknowledged,
            AlertAction::Resolve => AlertStatus::Resolved,
        }
    }
}

/// Everything the pipeline reacts to.
#[derive(Debug)]
pub enum BusEvent {
    Gps(IngestSignal),
    Gsm(GsmEvent),
    ManualSos,
    RecipientsChanged(Vec<String>),
    Command {
        action: AlertAction,
        alert_id: i64,
        reply: oneshot::Sender<TrackerResult<AlertEvent>>,
    },
}

/// Send a dashboard command and wait for the pipeline's answer.
pub async fn send_command(
    bus: &mpsc::Sender<BusEvent>,
    action: AlertAction,
    alert_id: i64,
) -> TrackerResult<AlertEvent> {
    let (reply, answer) = oneshot::channel();
    bus.send(BusEvent::Command {
        action,
        alert_id,
        reply,
    })
    .await
    .map_err(|_| TrackerError::ChannelClosed("pipeline"))?;
    answer
        .await
        .map_err(|_| TrackerError::ChannelClosed("pipeline reply"))?
}

pub struct Pipeline {
    evaluator: GeofenceEvaluator,
    alerts: AlertManager,
    snapshot: SystemSnapshot,
    snapshot_tx: watch::Sender<SystemSnapshot>,
    store_tx: mpsc::Sender<StoreRecord>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    /// Persisted fixes offered to the uploader, when one is configured.
    upload_tx: Option<mpsc::Sender<LocationFix>>,
    storage: Storage,
    /// Minimum spacing of persisted fixes, by fix time.
    persist_interval: chrono::Duration,
    last_persisted: Option<DateTime<Utc>>,
    tick: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        evaluator: GeofenceEvaluator,
        alerts: AlertManager,
        snapshot_tx: watch::Sender<SystemSnapshot>,
        store_tx: mpsc::Sender<StoreRecord>,
        outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
        storage: Storage,
        update_interval: Duration,
    ) -> Self {
        let snapshot = snapshot_tx.borrow().clone();
        Self {
            evaluator,
            alerts,
            snapshot,
            snapshot_tx,
            store_tx,
            outbound_tx,
            upload_tx: None,
            storage,
            persist_interval: chrono::Duration::from_std(update_interval)
                .unwrap_or(chrono::Duration::zero()),
            last_persisted: None,
            tick: update_interval,
        }
    }

    /// Offer every persisted fix to the uploader.
    pub fn with_uploads(mut self, upload_tx: mpsc::Sender<LocationFix>) -> Self {
        self.upload_tx = Some(upload_tx);
        self
    }

    pub async fn run(mut self, mut bus: mpsc::Receiver<BusEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = bus.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = tick.tick() => {
                    let outcome = self.alerts.on_tick(Utc::now());
                    self.apply(outcome).await;
                }
                _ = shutdown.changed() => {
                    while let Ok(event) = bus.try_recv() {
                        self.handle(event).await;
                    }
                    break;
                }
            }
        }

        debug!("Pipeline stopped");
    }

    pub async fn handle(&mut self, event: BusEvent) {
        let now = Utc::now();
        match event {
            BusEvent::Gps(IngestSignal::Fix(fix)) => self.on_fix(fix, now).await,
            BusEvent::Gps(IngestSignal::FixLost) => self.set_gps(GpsHealth::FixLost, now),
            BusEvent::Gps(IngestSignal::FixStale { ever_fixed }) => {
                self.alerts.observe_gps_stale(now);
                let health = if ever_fixed {
                    GpsHealth::Stale
                } else {
                    GpsHealth::Acquiring
                };
                self.set_gps(health, now);
            }
            BusEvent::Gps(IngestSignal::Disconnected) => {
                self.alerts.observe_gps_stale(now);
                self.set_gps(GpsHealth::Disconnected, now);
            }
            BusEvent::Gsm(GsmEvent::LinkChanged(state)) => {
                self.snapshot.gsm_state = state;
                self.publish(now);
                let outcome = self.alerts.observe_gsm_link(state == LinkState::Ready, now);
                self.apply(outcome).await;
            }
            BusEvent::Gsm(GsmEvent::MessageUpdate(message)) => {
                self.store(StoreRecord::Message(message)).await;
            }
            BusEvent::ManualSos => {
                info!("Manual SOS triggered");
                let outcome = self.alerts.raise_sos(now);
                self.apply(outcome).await;
            }
            BusEvent::RecipientsChanged(recipients) => self.alerts.set_recipients(recipients),
            BusEvent::Command {
                action,
                alert_id,
                reply,
            } => {
                let result = self.command(action, alert_id, now).await;
                if reply.send(result).is_err() {
                    debug!(alert_id, "Command caller went away");
                }
            }
        }
    }

    async fn on_fix(&mut self, fix: LocationFix, now: DateTime<Utc>) {
        let mut outcome = self.alerts.observe_fix(&fix, now);

        let evaluation = self.evaluator.evaluate(&fix);
        if let Some(evaluation) = &evaluation {
            self.snapshot.zone_state = evaluation.state;
            self.snapshot.distance_m = Some(evaluation.distance_m);
            if let Some(transition) = evaluation.transition {
                info!(
                    zone_id = %self.evaluator.zone().id,
                    ?transition,
                    distance_m = evaluation.distance_m,
                    "Zone transition"
                );
            }
            let zone_id = self.evaluator.zone().id.clone();
            let changes = self.alerts.on_evaluation(&zone_id, evaluation, now);
            outcome.alerts.extend(changes.alerts);
            outcome.messages.extend(changes.messages);
        }

        let transitioned = evaluation.is_some_and(|e| e.transition.is_some());
        let due = self
            .last_persisted
            .is_none_or(|last| fix.timestamp - last >= self.persist_interval);
        if due || transitioned {
            self.last_persisted = Some(fix.timestamp);
            self.store(StoreRecord::Fix(fix.clone())).await;
            self.offer_upload(&fix);
        }

        self.snapshot.latest_fix = Some(fix);
        self.snapshot.gps = GpsHealth::Locked;
        self.publish(now);

        self.apply(outcome).await;
    }

    async fn command(
        &mut self,
        action: AlertAction,
        alert_id: i64,
        now: DateTime<Utc>,
    ) -> TrackerResult<AlertEvent> {
        let result = match action {
            AlertAction::Acknowledge => self.alerts.acknowledge(alert_id),
            AlertAction::Resolve => self.alerts.resolve(alert_id, now),
        };

        match result {
            Ok(alert) => {
                self.store(StoreRecord::Alert(alert.clone())).await;
                Ok(alert)
            }
            // Inactive alerts are only in the store
            Err(TrackerError::NotFound { .. }) => match self.storage.alert_by_id(alert_id).await? {
                Some(stored) => Err(TrackerError::InvalidTransition {
                    id: alert_id,
                    from: stored.status.as_str().to_string(),
                    to: action.target().as_str().to_string(),
                }),
                None => Err(TrackerError::NotFound {
                    resource: "alert",
                    id: alert_id,
                }),
            },
            Err(e) => Err(e),
        }
    }

    /// Persist alert changes and new messages, then hand the messages to the modem.
    async fn apply(&mut self, outcome: AlertOutcome) {
        if outcome.is_empty() {
            return;
        }
        for alert in outcome.alerts {
            self.store(StoreRecord::Alert(alert)).await;
        }
        for message in &outcome.messages {
            self.store(StoreRecord::Message(message.clone())).await;
        }
        for message in outcome.messages {
            let id = message.id;
            if self.outbound_tx.send(message).is_err() {
                warn!(message_id = id, "GSM link stopped, message left queued in store");
            }
        }
    }

    fn offer_upload(&self, fix: &LocationFix) {
        let Some(uploads) = &self.upload_tx else {
            return;
        };
        match uploads.try_send(fix.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(timestamp = %fix.timestamp, "Upload queue full, fix not uploaded");
            }
        }
    }

    async fn store(&self, record: StoreRecord) {
        if self.store_tx.send(record).await.is_err() {
            warn!("Store writer stopped, record not persisted");
        }
    }

    fn set_gps(&mut self, health: GpsHealth, now: DateTime<Utc>) {
        if self.snapshot.gps != health {
            info!(from = ?self.snapshot.gps, to = ?health, "GPS health changed");
        }
        self.snapshot.gps = health;
        self.publish(now);
    }

    fn publish(&mut self, now: DateTime<Utc>) {
        self.snapshot.updated_at = now;
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }
}
