//! Alert lifecycle and deduplication.
//!
//! The [`AlertManager`] is a plain state machine owned by the pipeline task.
//! It never performs I/O: every operation returns an [`AlertOutcome`] listing
//! the alert records to persist and the messages to queue, and the pipeline
//! carries those out. This keeps the dedupe table single-writer and makes the
//! lifecycle testable without a store or a modem.
//!
//! Per dedupe key ([`AlertKind`]) the lifecycle is
//! `no_alert → open → (acknowledged) → resolved → no_alert`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::geofence::{Evaluation, ZoneTransition};
use crate::model::{
    AlertEvent, AlertKind, AlertStatus, LocationFix, MessageStatus, OutboundMessage,
};

/// Alert policy knobs.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub patient_id: String,
    pub recipients: Vec<String>,
    /// Consecutive inner fixes needed to auto-resolve an exit alert.
    pub confirm_fixes: u32,
    /// Staleness or modem outage duration that raises device_offline.
    pub offline_after: Duration,
    pub notify_on_return: bool,
}

/// Records produced by one alert manager operation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AlertOutcome {
    /// New or changed alerts, in the order they changed.
    pub alerts: Vec<AlertEvent>,
    /// Newly created messages to persist and queue.
    pub messages: Vec<OutboundMessage>,
}

impl AlertOutcome {
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.messages.is_empty()
    }

    fn merge(&mut self, other: AlertOutcome) {
        self.alerts.extend(other.alerts);
        self.messages.extend(other.messages);
    }
}

/// Resolved alert ids remembered for rejecting repeated commands.
const RECENTLY_CLOSED: usize = 256;

pub struct AlertManager {
    settings: AlertSettings,
    /// Dedupe table: at most one active alert per kind.
    active: HashMap<AlertKind, AlertEvent>,
    /// Consecutive confirming fixes per zone.
    confirming: HashMap<String, u32>,
    recently_closed: VecDeque<i64>,
    next_alert_id: i64,
    next_message_id: i64,
    last_fix: Option<LocationFix>,
    gps_stale_since: Option<DateTime<Utc>>,
    gsm_down_since: Option<DateTime<Utc>>,
}

impl AlertManager {
    /// Create a manager. `next_ids` are the first free alert and message ids.
    ///
    /// The modem counts as down from `now` until the link reports READY.
    pub fn new(settings: AlertSettings, next_ids: (i64, i64), now: DateTime<Utc>) -> Self {
        Self {
            settings,
            active: HashMap::new(),
            confirming: HashMap::new(),
            recently_closed: VecDeque::new(),
            next_alert_id: next_ids.0,
            next_message_id: next_ids.1,
            last_fix: None,
            gps_stale_since: None,
            gsm_down_since: Some(now),
        }
    }

    /// Reload alerts that were still active when the process stopped.
    pub fn restore(&mut self, alerts: Vec<AlertEvent>) {
        for alert in alerts.into_iter().filter(|a| a.status.is_active()) {
            self.next_alert_id = self.next_alert_id.max(alert.id + 1);
            if let Some(existing) = self.active.get(&alert.kind) {
                warn!(
                    alert_id = alert.id,
                    kept = existing.id,
                    kind = alert.kind.type_name(),
                    "Duplicate active alert in store, keeping the older one"
                );
                continue;
            }
            self.active.insert(alert.kind.clone(), alert);
        }
    }

    pub fn set_last_fix(&mut self, fix: Option<LocationFix>) {
        self.last_fix = fix;
    }

    /// Replace the recipients of alerts opened from now on.
    pub fn set_recipients(&mut self, recipients: Vec<String>) {
        info!(count = recipients.len(), "Emergency recipients updated");
        self.settings.recipients = recipients;
    }

    pub fn active_alerts(&self) -> impl Iterator<Item = &AlertEvent> {
        self.active.values()
    }

    pub fn active_alert(&self, kind: &AlertKind) -> Option<&AlertEvent> {
        self.active.get(kind)
    }

    /// A valid fix arrived: GPS is healthy again.
    pub fn observe_fix(&mut self, fix: &LocationFix, now: DateTime<Utc>) -> AlertOutcome {
        self.last_fix = Some(fix.clone());
        self.gps_stale_since = None;
        self.check_offline(now)
    }

    /// The GPS ingest reported staleness.
    pub fn observe_gps_stale(&mut self, now: DateTime<Utc>) {
        self.gps_stale_since.get_or_insert(now);
    }

    /// The modem link went up or down.
    pub fn observe_gsm_link(&mut self, up: bool, now: DateTime<Utc>) -> AlertOutcome {
        if up {
            self.gsm_down_since = None;
        } else {
            self.gsm_down_since.get_or_insert(now);
        }
        self.check_offline(now)
    }

    /// Periodic check of the offline timers.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> AlertOutcome {
        self.check_offline(now)
    }

    /// Apply one geofence evaluation for `zone_id`.
    pub fn on_evaluation(
        &mut self,
        zone_id: &str,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> AlertOutcome {
        let exit_kind = AlertKind::GeofenceExit {
            zone_id: zone_id.to_string(),
        };

        if evaluation.transition == Some(ZoneTransition::Exit) {
            self.confirming.insert(zone_id.to_string(), 0);
            let message = format!(
                "ALERT {}: left safe zone {}, {:.0}m from center.{}",
                self.settings.patient_id,
                zone_id,
                evaluation.distance_m,
                self.location_suffix()
            );
            return self.raise(exit_kind, message, now);
        }

        if !self.active.contains_key(&exit_kind) {
            return AlertOutcome::default();
        }

        let count = self.confirming.entry(zone_id.to_string()).or_insert(0);
        if evaluation.within_inner {
            *count += 1;
        } else {
            *count = 0;
        }
        debug!(zone_id, confirming = *count, "Return confirmation");
        if *count < self.settings.confirm_fixes {
            return AlertOutcome::default();
        }

        self.confirming.insert(zone_id.to_string(), 0);
        let mut outcome = AlertOutcome::default();
        if let Some(resolved) = self.close(&exit_kind, now) {
            info!(alert_id = resolved.id, zone_id, "Exit alert auto-resolved");
            outcome.alerts.push(resolved);
        }
        outcome.merge(self.record_return(zone_id, evaluation.distance_m, now));
        outcome
    }

    /// The SOS input was triggered.
    pub fn raise_sos(&mut self, now: DateTime<Utc>) -> AlertOutcome {
        let message = format!(
            "SOS {}: emergency button pressed.{}",
            self.settings.patient_id,
            self.location_suffix()
        );
        self.raise(AlertKind::ManualSos, message, now)
    }

    /// Dashboard acknowledgement: open → acknowledged.
    pub fn acknowledge(&mut self, id: i64) -> TrackerResult<AlertEvent> {
        if !self.active.values().any(|a| a.id == id) {
            return Err(self.not_active(id, AlertStatus::Acknowledged));
        }
        let alert = self
            .active
            .values_mut()
            .find(|a| a.id == id)
            .ok_or(TrackerError::NotFound {
                resource: "alert",
                id,
            })?;
        if !alert.status.can_transition_to(AlertStatus::Acknowledged) {
            return Err(TrackerError::InvalidTransition {
                id,
                from: alert.status.as_str().to_string(),
                to: AlertStatus::Acknowledged.as_str().to_string(),
            });
        }
        alert.status = AlertStatus::Acknowledged;
        info!(alert_id = id, "Alert acknowledged");
        Ok(alert.clone())
    }

    /// Dashboard resolution: open|acknowledged → resolved. Terminal.
    pub fn resolve(&mut self, id: i64, now: DateTime<Utc>) -> TrackerResult<AlertEvent> {
        let Some(kind) = self.active.values().find(|a| a.id == id).map(|a| a.kind.clone()) else {
            return Err(self.not_active(id, AlertStatus::Resolved));
        };
        if let Some(zone_id) = kind.zone_id() {
            self.confirming.remove(zone_id);
        }
        let resolved = self.close(&kind, now).ok_or(TrackerError::NotFound {
            resource: "alert",
            id,
        })?;
        info!(alert_id = id, "Alert resolved");
        Ok(resolved)
    }

    /// Error for a command on an alert that is not active.
    ///
    /// Alerts closed by this process are known to be resolved; anything else
    /// is reported as not found and left to the caller to look up.
    fn not_active(&self, id: i64, target: AlertStatus) -> TrackerError {
        if self.recently_closed.contains(&id) {
            TrackerError::InvalidTransition {
                id,
                from: AlertStatus::Resolved.as_str().to_string(),
                to: target.as_str().to_string(),
            }
        } else {
            TrackerError::NotFound {
                resource: "alert",
                id,
            }
        }
    }

    fn remember_closed(&mut self, id: i64) {
        if self.recently_closed.len() >= RECENTLY_CLOSED {
            self.recently_closed.pop_front();
        }
        self.recently_closed.push_back(id);
    }

    fn raise(&mut self, kind: AlertKind, message: String, now: DateTime<Utc>) -> AlertOutcome {
        if let Some(existing) = self.active.get(&kind) {
            debug!(
                alert_id = existing.id,
                kind = kind.type_name(),
                "Alert already active, absorbing duplicate"
            );
            return AlertOutcome::default();
        }

        let alert = self.new_alert(kind.clone(), message, AlertStatus::Open, now);
        let messages = self.messages_for(&alert, now);
        info!(
            alert_id = alert.id,
            kind = kind.type_name(),
            recipients = messages.len(),
            "Alert raised"
        );
        self.active.insert(kind, alert.clone());

        AlertOutcome {
            alerts: vec![alert],
            messages,
        }
    }

    /// Remove an active alert and mark it resolved.
    fn close(&mut self, kind: &AlertKind, now: DateTime<Utc>) -> Option<AlertEvent> {
        let mut alert = self.active.remove(kind)?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        self.remember_closed(alert.id);
        Some(alert)
    }

    /// Confirmed return: recorded as an already-resolved event.
    fn record_return(&mut self, zone_id: &str, distance_m: f64, now: DateTime<Utc>) -> AlertOutcome {
        let message = format!(
            "INFO {}: back inside safe zone {}, {:.0}m from center.",
            self.settings.patient_id, zone_id, distance_m
        );
        let kind = AlertKind::GeofenceEnterConfirm {
            zone_id: zone_id.to_string(),
        };
        let mut alert = self.new_alert(kind, message, AlertStatus::Resolved, now);
        alert.resolved_at = Some(now);
        self.remember_closed(alert.id);

        let messages = if self.settings.notify_on_return {
            self.messages_for(&alert, now)
        } else {
            Vec::new()
        };

        AlertOutcome {
            alerts: vec![alert],
            messages,
        }
    }

    fn check_offline(&mut self, now: DateTime<Utc>) -> AlertOutcome {
        let offline_after = chrono::Duration::from_std(self.settings.offline_after)
            .unwrap_or(chrono::Duration::MAX);
        let expired = |since: Option<DateTime<Utc>>| since.is_some_and(|s| now - s >= offline_after);

        let reason = if expired(self.gps_stale_since) {
            Some("no GPS fix")
        } else if expired(self.gsm_down_since) {
            Some("modem unreachable")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let message = format!(
                    "ALERT {}: tracker offline ({}).{}",
                    self.settings.patient_id,
                    reason,
                    self.location_suffix()
                );
                self.raise(AlertKind::DeviceOffline, message, now)
            }
            None if self.gps_stale_since.is_none() && self.gsm_down_since.is_none() => {
                let mut outcome = AlertOutcome::default();
                if let Some(resolved) = self.close(&AlertKind::DeviceOffline, now) {
                    info!(alert_id = resolved.id, "Device back online, offline alert resolved");
                    outcome.alerts.push(resolved);
                }
                outcome
            }
            None => AlertOutcome::default(),
        }
    }

    fn new_alert(
        &mut self,
        kind: AlertKind,
        message: String,
        status: AlertStatus,
        now: DateTime<Utc>,
    ) -> AlertEvent {
        let id = self.next_alert_id;
        self.next_alert_id += 1;
        AlertEvent {
            id,
            kind,
            message,
            latitude: self.last_fix.as_ref().map(|f| f.latitude),
            longitude: self.last_fix.as_ref().map(|f| f.longitude),
            created_at: now,
            resolved_at: None,
            status,
        }
    }

    /// One queued message per distinct recipient.
    fn messages_for(&mut self, alert: &AlertEvent, now: DateTime<Utc>) -> Vec<OutboundMessage> {
        let mut seen = HashSet::new();
        let recipients: Vec<String> = self
            .settings
            .recipients
            .iter()
            .filter(|r| seen.insert(r.as_str()))
            .cloned()
            .collect();

        recipients
            .into_iter()
            .map(|recipient| {
                let id = self.next_message_id;
                self.next_message_id += 1;
                OutboundMessage {
                    id,
                    alert_id: alert.id,
                    recipient,
                    body: alert.message.clone(),
                    status: MessageStatus::Queued,
                    attempt_count: 0,
                    last_error: None,
                    next_attempt_at: now,
                    updated_at: now,
                }
            })
            .collect()
    }

    fn location_suffix(&self) -> String {
        match &self.last_fix {
            Some(fix) => format!(" Loc {:.5},{:.5}", fix.latitude, fix.longitude),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixQuality, ZoneState};

    fn settings() -> AlertSettings {
        AlertSettings {
            patient_id: "P1".to_string(),
            recipients: vec!["+911111111111".to_string(), "+922222222222".to_string()],
            confirm_fixes: 2,
            offline_after: Duration::from_secs(300),
            notify_on_return: true,
        }
    }

    fn manager() -> AlertManager {
        let mut manager = AlertManager::new(settings(), (1, 1), Utc::now());
        manager.observe_gsm_link(true, Utc::now());
        manager
    }

    fn eval(distance_m: f64, transition: Option<ZoneTransition>) -> Evaluation {
        Evaluation {
            distance_m,
            state: if distance_m < 100.0 {
                ZoneState::Inside
            } else {
                ZoneState::Outside
            },
            transition,
            within_inner: distance_m < 95.0,
        }
    }

    fn exit_kind() -> AlertKind {
        AlertKind::GeofenceExit {
            zone_id: "home".to_string(),
        }
    }

    fn fix() -> LocationFix {
        LocationFix {
            timestamp: Utc::now(),
            latitude: 12.97,
            longitude: 77.59,
            altitude: None,
            speed: 0.0,
            fix_quality: FixQuality::Gps,
            satellite_count: 7,
            hdop: None,
        }
    }

    #[test]
    fn test_exit_opens_alert_with_one_message_per_recipient() {
        let mut manager = manager();
        let outcome = manager.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), Utc::now());

        assert_eq!(outcome.alerts.len(), 1);
        let alert = &outcome.alerts[0];
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(alert.kind, exit_kind());

        assert_eq!(outcome.messages.len(), 2);
        assert!(outcome.messages.iter().all(|m| m.alert_id == alert.id));
        assert!(outcome.messages.iter().all(|m| m.status == MessageStatus::Queued));
        assert_ne!(outcome.messages[0].id, outcome.messages[1].id);
    }

    #[test]
    fn test_second_exit_is_absorbed() {
        let mut manager = manager();
        let now = Utc::now();
        let first = manager.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), now);
        let second = manager.on_evaluation("home", &eval(250.0, Some(ZoneTransition::Exit)), now);

        assert_eq!(first.alerts.len(), 1);
        assert!(second.is_empty());
        assert_eq!(manager.active_alerts().count(), 1);
    }

    #[test]
    fn test_single_inside_fix_does_not_resolve() {
        let mut manager = manager();
        let now = Utc::now();
        manager.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), now);

        assert!(manager.on_evaluation("home", &eval(50.0, Some(ZoneTransition::Enter)), now).is_empty());
        assert!(manager.on_evaluation("home", &eval(180.0, Some(ZoneTransition::Exit)), now).is_empty());
        assert!(manager.on_evaluation("home", &eval(50.0, Some(ZoneTransition::Enter)), now).is_empty());

        assert_eq!(
            manager.active_alert(&exit_kind()).map(|a| a.status),
            Some(AlertStatus::Open)
        );
    }

    #[test]
    fn test_fix_in_dead_band_resets_confirmation() {
        let mut manager = manager();
        let now = Utc::now();
        manager.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), now);
        manager.on_evaluation("home", &eval(50.0, Some(ZoneTransition::Enter)), now);
        manager.on_evaluation("home", &eval(98.0, None), now);
        assert!(manager.on_evaluation("home", &eval(40.0, None), now).is_empty());
        assert!(manager.active_alert(&exit_kind()).is_some());
    }

    #[test]
    fn test_confirmed_return_resolves_and_records_enter() {
        let mut manager = manager();
        let now = Utc::now();
        let opened = manager.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), now);
        manager.on_evaluation("home", &eval(50.0, Some(ZoneTransition::Enter)), now);
        let outcome = manager.on_evaluation("home", &eval(40.0, None), now);

        assert_eq!(outcome.alerts.len(), 2);
        assert_eq!(outcome.alerts[0].id, opened.alerts[0].id);
        assert_eq!(outcome.alerts[0].status, AlertStatus::Resolved);
        assert!(outcome.alerts[0].resolved_at.is_some());
        assert_eq!(
            outcome.alerts[1].kind,
            AlertKind::GeofenceEnterConfirm {
                zone_id: "home".to_string()
            }
        );
        assert_eq!(outcome.alerts[1].status, AlertStatus::Resolved);
        assert_eq!(outcome.messages.len(), 2);
        assert!(manager.active_alert(&exit_kind()).is_none());

        // A new breach opens a new alert
        let again = manager.on_evaluation("home", &eval(300.0, Some(ZoneTransition::Exit)), now);
        assert_eq!(again.alerts.len(), 1);
        assert!(again.alerts[0].id > outcome.alerts[1].id);
    }

    #[test]
    fn test_acknowledge_then_resolve() {
        let mut manager = manager();
        let now = Utc::now();
        let id = manager.raise_sos(now).alerts[0].id;

        assert_eq!(manager.acknowledge(id).unwrap().status, AlertStatus::Acknowledged);
        assert!(matches!(
            manager.acknowledge(id),
            Err(TrackerError::InvalidTransition { .. })
        ));
        // Still deduplicated while acknowledged
        assert!(manager.raise_sos(now).is_empty());

        let resolved = manager.resolve(id, now).unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(matches!(
            manager.resolve(id, now),
            Err(TrackerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.acknowledge(id),
            Err(TrackerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.acknowledge(999),
            Err(TrackerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_recipients_get_one_message() {
        let mut s = settings();
        s.recipients = vec!["+911111111111".to_string(), "+911111111111".to_string()];
        let mut manager = AlertManager::new(s, (1, 1), Utc::now());
        assert_eq!(manager.raise_sos(Utc::now()).messages.len(), 1);
    }

    #[test]
    fn test_recipient_change_applies_to_new_alerts_only() {
        let mut manager = manager();
        let now = Utc::now();
        let sos = manager.raise_sos(now);
        assert_eq!(sos.messages.len(), 2);

        manager.set_recipients(vec!["+933333333333".to_string()]);
        let exit = manager.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), now);
        assert_eq!(exit.messages.len(), 1);
        assert_eq!(exit.messages[0].recipient, "+933333333333");
    }

    #[test]
    fn test_device_offline_after_timeout_and_recovery() {
        let start = Utc::now();
        let mut manager = manager();
        manager.observe_fix(&fix(), start);
        manager.observe_gps_stale(start);

        assert!(manager.on_tick(start + chrono::Duration::seconds(299)).is_empty());
        let outcome = manager.on_tick(start + chrono::Duration::seconds(300));
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].kind, AlertKind::DeviceOffline);
        assert!(outcome.alerts[0].message.contains("no GPS fix"));
        assert!(manager.on_tick(start + chrono::Duration::seconds(400)).is_empty());

        let recovered = manager.observe_fix(&fix(), start + chrono::Duration::seconds(410));
        assert_eq!(recovered.alerts.len(), 1);
        assert_eq!(recovered.alerts[0].status, AlertStatus::Resolved);
    }

    #[test]
    fn test_modem_outage_raises_offline() {
        let start = Utc::now();
        let mut manager = AlertManager::new(settings(), (1, 1), start);
        let outcome = manager.on_tick(start + chrono::Duration::seconds(301));
        assert_eq!(outcome.alerts[0].kind, AlertKind::DeviceOffline);
        assert!(outcome.alerts[0].message.contains("modem"));
    }

    #[test]
    fn test_restore_keeps_dedupe_across_restart() {
        let mut first = manager();
        let opened = first.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), Utc::now());

        let mut restarted = AlertManager::new(settings(), (1, 1), Utc::now());
        restarted.restore(opened.alerts.clone());
        let again = restarted.on_evaluation("home", &eval(200.0, Some(ZoneTransition::Exit)), Utc::now());
        assert!(again.is_empty());

        let sos = restarted.raise_sos(Utc::now());
        assert!(sos.alerts[0].id > opened.alerts[0].id);
    }
}
