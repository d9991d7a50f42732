//! Tracker configuration.
//!
//! Configuration is read from a JSON file whose path comes from the
//! `TRACKER_CONFIG` environment variable. Every option has a default, so a
//! missing file yields a tracker with the default zone and no recipients.
//! Validation runs once at startup; an invalid geofence refuses to start the
//! process rather than run with undefined zone behavior.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{TrackerError, TrackerResult};
use crate::model::GeofenceZone;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Identifier of the tracked patient, included in SMS bodies and fix rows.
    pub patient_id: String,

    /// GPS receiver serial device.
    pub gps_port: PathBuf,

    /// GSM modem serial device.
    pub gsm_port: PathBuf,

    /// Minimum spacing between persisted fixes, and the pipeline tick.
    pub update_interval_seconds: u64,

    pub geofence: GeofenceConfig,

    /// Recipients of alert SMS.
    pub emergency_numbers: Vec<String>,

    /// Fixes older than this are removed by compaction.
    pub retention_days: u32,

    /// Send attempts per SMS before it is marked failed.
    pub max_sms_retries: u32,

    /// Consecutive inside fixes required to auto-resolve an exit alert.
    pub alert_confirm_fixes: u32,

    /// Sysfs GPIO value file (or any file holding `0`/`1`) wired to the SOS button.
    pub sos_input: Option<PathBuf>,

    pub sos_poll_millis: u64,

    /// Window without a valid fix after which GPS is reported stale.
    pub gps_stale_seconds: u64,

    /// How long GPS staleness or a modem outage must last to raise device_offline.
    pub device_offline_seconds: u64,

    /// Interval of the modem liveness probe.
    pub gsm_probe_seconds: u64,

    /// Deadline for the final response to an SMS send.
    pub sms_timeout_seconds: u64,

    /// Fixes implying a faster movement than this are rejected as jumps.
    pub max_plausible_speed_mps: f64,

    /// Notify recipients when the patient is confirmed back inside the zone.
    pub notify_on_return: bool,

    /// Records held in memory while the store is unavailable.
    pub persistence_backlog: usize,

    /// Grace period for in-flight serial operations at shutdown.
    pub shutdown_drain_seconds: u64,

    /// Remote endpoint that receives each persisted fix as JSON. Uploads are
    /// disabled when unset.
    pub server_url: Option<String>,
}

/// Geofence section of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub id: String,
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub hysteresis_fraction: f64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            id: "home".to_string(),
            enabled: true,
            latitude: 40.7128,
            longitude: -74.0060,
            radius_m: 100.0,
            hysteresis_fraction: 0.05,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            patient_id: "PATIENT001".to_string(),
            gps_port: PathBuf::from("/dev/ttyS0"),
            gsm_port: PathBuf::from("/dev/ttyUSB0"),
            update_interval_seconds: 10,
            geofence: GeofenceConfig::default(),
            emergency_numbers: Vec::new(),
            retention_days: 30,
            max_sms_retries: 3,
            alert_confirm_fixes: 2,
            sos_input: None,
            sos_poll_millis: 200,
            gps_stale_seconds: 30,
            device_offline_seconds: 300,
            gsm_probe_seconds: 60,
            sms_timeout_seconds: 60,
            max_plausible_speed_mps: 70.0,
            notify_on_return: true,
            persistence_backlog: 1024,
            shutdown_drain_seconds: 5,
            server_url: None,
        }
    }
}

impl TrackerConfig {
    /// Load and validate the configuration file.
    ///
    /// A missing file is not an error: defaults are used and a warning logged.
    pub fn load(path: &Path) -> TrackerResult<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Configuration file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(TrackerError::Config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration document without validating it.
    pub fn from_json(text: &str) -> TrackerResult<Self> {
        serde_json::from_str(text).map_err(|e| TrackerError::Config(e.to_string()))
    }

    /// Check every value the pipeline relies on.
    pub fn validate(&self) -> TrackerResult<()> {
        let g = &self.geofence;
        if !g.latitude.is_finite() || !(-90.0..=90.0).contains(&g.latitude) {
            return Err(TrackerError::GeofenceConfig(format!(
                "latitude {} out of range",
                g.latitude
            )));
        }
        if !g.longitude.is_finite() || !(-180.0..=180.0).contains(&g.longitude) {
            return Err(TrackerError::GeofenceConfig(format!(
                "longitude {} out of range",
                g.longitude
            )));
        }
        if !g.radius_m.is_finite() || g.radius_m <= 0.0 {
            return Err(TrackerError::GeofenceConfig(format!(
                "radius {} must be positive",
                g.radius_m
            )));
        }
        if !(0.0..1.0).contains(&g.hysteresis_fraction) {
            return Err(TrackerError::GeofenceConfig(format!(
                "hysteresis fraction {} must be in [0, 1)",
                g.hysteresis_fraction
            )));
        }
        if g.id.trim().is_empty() {
            return Err(TrackerError::GeofenceConfig("zone id is empty".into()));
        }

        for number in &self.emergency_numbers {
            if !is_valid_phone_number(number) {
                return Err(TrackerError::Config(format!(
                    "invalid emergency number {:?}",
                    number
                )));
            }
        }
        if self.emergency_numbers.is_empty() {
            warn!("No emergency numbers configured, alerts will not be sent by SMS");
        }

        if self.max_sms_retries == 0 {
            return Err(TrackerError::Config("max_sms_retries must be at least 1".into()));
        }
        if self.alert_confirm_fixes == 0 {
            return Err(TrackerError::Config(
                "alert_confirm_fixes must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("update_interval_seconds", self.update_interval_seconds),
            ("gps_stale_seconds", self.gps_stale_seconds),
            ("gsm_probe_seconds", self.gsm_probe_seconds),
            ("sms_timeout_seconds", self.sms_timeout_seconds),
            ("sos_poll_millis", self.sos_poll_millis),
            ("shutdown_drain_seconds", self.shutdown_drain_seconds),
        ] {
            if value == 0 {
                return Err(TrackerError::Config(format!("{} must be positive", name)));
            }
        }
        if self.max_plausible_speed_mps.is_nan() || self.max_plausible_speed_mps <= 0.0 {
            return Err(TrackerError::Config(
                "max_plausible_speed_mps must be positive".into(),
            ));
        }
        if self.persistence_backlog == 0 {
            return Err(TrackerError::Config(
                "persistence_backlog must be at least 1".into(),
            ));
        }
        if let Some(url) = &self.server_url {
            match reqwest::Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                _ => {
                    return Err(TrackerError::Config(format!(
                        "server_url {:?} is not an http(s) URL",
                        url
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn zone(&self) -> GeofenceZone {
        GeofenceZone {
            id: self.geofence.id.clone(),
            latitude: self.geofence.latitude,
            longitude: self.geofence.longitude,
            radius_m: self.geofence.radius_m,
            hysteresis_fraction: self.geofence.hysteresis_fraction,
            enabled: self.geofence.enabled,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn sms_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::sms(self.max_sms_retries)
    }
}

/// `+` followed by 3 to 15 digits, or bare digits.
fn is_valid_phone_number(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    (3..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl RetryPolicy {
    /// SMS delivery: 5s, doubling, capped at 60s.
    pub fn sms(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(5),
            multiplier: 2,
            cap: Duration::from_secs(60),
        }
    }

    /// Serial device reconnect and modem bring-up. Retries until shutdown.
    pub fn link() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(2),
            multiplier: 2,
            cap: Duration::from_secs(60),
        }
    }

    /// Store writes: a record is abandoned after this many failures.
    pub fn persistence() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
            cap: Duration::from_secs(30),
        }
    }

    /// Fix uploads: three attempts, then the fix is skipped.
    pub fn upload() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(10),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Whether `attempts` failures use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alert_confirm_fixes, 2);
        assert_eq!(config.zone().radius_m, 100.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrackerConfig::from_json(
            r#"{
                "patient_id": "P7",
                "emergency_numbers": ["+918848776875"],
                "geofence": { "latitude": 12.9716, "longitude": 77.5946, "radius_m": 150 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.patient_id, "P7");
        assert_eq!(config.geofence.radius_m, 150.0);
        assert_eq!(config.geofence.hysteresis_fraction, 0.05);
        assert!(config.geofence.enabled);
        assert_eq!(config.max_sms_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_geofence_is_fatal() {
        let mut config = TrackerConfig::default();
        config.geofence.latitude = 91.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TrackerError::GeofenceConfig(_)));
        assert!(err.is_fatal());

        let mut config = TrackerConfig::default();
        config.geofence.radius_m = 0.0;
        assert!(matches!(
            config.validate(),
            Err(TrackerError::GeofenceConfig(_))
        ));

        let mut config = TrackerConfig::default();
        config.geofence.radius_m = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_phone_numbers() {
        let mut config = TrackerConfig::default();
        config.emergency_numbers = vec!["+91\"; AT+CFUN=0".to_string()];
        assert!(matches!(config.validate(), Err(TrackerError::Config(_))));

        assert!(is_valid_phone_number("+9175929912412"));
        assert!(is_valid_phone_number("112"));
        assert!(!is_valid_phone_number("+12"));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let zeroed: [fn(&mut TrackerConfig); 6] = [
            |c| c.update_interval_seconds = 0,
            |c| c.gps_stale_seconds = 0,
            |c| c.gsm_probe_seconds = 0,
            |c| c.sms_timeout_seconds = 0,
            |c| c.sos_poll_millis = 0,
            |c| c.shutdown_drain_seconds = 0,
        ];
        for zero in zeroed {
            let mut config = TrackerConfig::default();
            zero(&mut config);
            let err = config.validate().unwrap_err();
            assert!(matches!(err, TrackerError::Config(_)), "{}", err);
            assert!(err.is_fatal());
        }

        let config =
            TrackerConfig::from_json(r#"{ "gsm_probe_seconds": 0, "sos_poll_millis": 200 }"#)
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_url_must_be_http() {
        let mut config = TrackerConfig::default();
        config.server_url = Some("http://127.0.0.1:8080/api/location".to_string());
        assert!(config.validate().is_ok());

        config.server_url = Some("not a url".to_string());
        assert!(matches!(config.validate(), Err(TrackerError::Config(_))));

        config.server_url = Some("ftp://example.org/fixes".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = TrackerConfig::load(Path::new("/nonexistent/tracker.json")).unwrap();
        assert_eq!(config.patient_id, "PATIENT001");
    }

    #[test]
    fn test_sms_backoff_doubles_and_caps() {
        let policy = RetryPolicy::sms(5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(40));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
