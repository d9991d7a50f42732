//! Data models for the patient tracker.
//!
//! Everything the pipeline passes between tasks, persists, or serves through
//! the dashboard API is defined here. Records are plain values: once a
//! [`LocationFix`] is created it is never mutated, and alert/message status
//! changes produce updated copies that are written back to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GPS receiver's confidence in a position reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixQuality {
    /// No position available.
    NoFix,
    /// Autonomous GPS fix.
    Gps,
    /// Differentially corrected fix.
    Dgps,
}

impl FixQuality {
    /// Map the GGA quality indicator field.
    ///
    /// RTK and PPS fixes are at least as good as DGPS and are reported as such.
    /// Dead-reckoning estimates, manual input and simulator output are not
    /// real fixes.
    pub fn from_gga(indicator: u8) -> Self {
        match indicator {
            1 => FixQuality::Gps,
            2..=5 => FixQuality::Dgps,
            _ => FixQuality::NoFix,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixQuality::NoFix => "no_fix",
            FixQuality::Gps => "gps",
            FixQuality::Dgps => "dgps",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_fix" => Some(FixQuality::NoFix),
            "gps" => Some(FixQuality::Gps),
            "dgps" => Some(FixQuality::Dgps),
            _ => None,
        }
    }
}

/// A validated position reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// UTC time reported by the receiver.
    pub timestamp: DateTime<Utc>,

    /// Decimal degrees, positive north.
    pub latitude: f64,

    /// Decimal degrees, positive east.
    pub longitude: f64,

    /// Metres above mean sea level, when the receiver reports it.
    pub altitude: Option<f64>,

    /// Speed over ground in metres per second.
    pub speed: f64,

    pub fix_quality: FixQuality,

    pub satellite_count: u8,

    /// Horizontal dilution of precision.
    pub hdop: Option<f64>,
}

/// A circular safe zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceZone {
    /// Zone identifier, part of the alert dedupe key.
    pub id: String,

    pub latitude: f64,

    pub longitude: f64,

    pub radius_m: f64,

    /// Width of the dead-band on each side of the boundary, as a fraction of the radius.
    pub hysteresis_fraction: f64,

    pub enabled: bool,
}

impl GeofenceZone {
    /// Distance below which a fix counts as confirmed inside.
    pub fn inner_radius(&self) -> f64 {
        self.radius_m * (1.0 - self.hysteresis_fraction)
    }

    /// Distance above which a fix counts as confirmed outside.
    pub fn outer_radius(&self) -> f64 {
        self.radius_m * (1.0 + self.hysteresis_fraction)
    }
}

/// The condition an alert reports.
///
/// This is also the dedupe key: at most one active alert exists per value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// Patient left the zone.
    GeofenceExit { zone_id: String },
    /// Patient returned to the zone and the return was confirmed.
    GeofenceEnterConfirm { zone_id: String },
    /// GPS fix stale or modem link down for too long.
    DeviceOffline,
    /// SOS button pressed.
    ManualSos,
}

impl AlertKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            AlertKind::GeofenceExit { .. } => "geofence_exit",
            AlertKind::GeofenceEnterConfirm { .. } => "geofence_enter_confirm",
            AlertKind::DeviceOffline => "device_offline",
            AlertKind::ManualSos => "manual_sos",
        }
    }

    pub fn zone_id(&self) -> Option<&str> {
        match self {
            AlertKind::GeofenceExit { zone_id } | AlertKind::GeofenceEnterConfirm { zone_id } => {
                Some(zone_id)
            }
            AlertKind::DeviceOffline | AlertKind::ManualSos => None,
        }
    }

    /// Rebuild a kind from its stored columns.
    pub fn from_parts(type_name: &str, zone_id: Option<String>) -> Option<Self> {
        match (type_name, zone_id) {
            ("geofence_exit", Some(zone_id)) => Some(AlertKind::GeofenceExit { zone_id }),
            ("geofence_enter_confirm", Some(zone_id)) => {
                Some(AlertKind::GeofenceEnterConfirm { zone_id })
            }
            ("device_offline", _) => Some(AlertKind::DeviceOffline),
            ("manual_sos", _) => Some(AlertKind::ManualSos),
            _ => None,
        }
    }
}

/// Lifecycle status of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    /// Terminal.
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(AlertStatus::Open),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }

    /// Open and acknowledged alerts both hold their dedupe key.
    pub fn is_active(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }

    /// Allowed moves: open→acknowledged, open→resolved, acknowledged→resolved.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Open, AlertStatus::Acknowledged)
                | (AlertStatus::Open, AlertStatus::Resolved)
                | (AlertStatus::Acknowledged, AlertStatus::Resolved)
        )
    }
}

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,

    #[serde(flatten)]
    pub kind: AlertKind,

    /// Human-readable description, also the base of the SMS body.
    pub message: String,

    /// Last known position when the alert was raised.
    pub latitude: Option<f64>,

    pub longitude: Option<f64>,

    pub created_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,

    pub status: AlertStatus,
}

/// Delivery status of an outbound SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(MessageStatus::Queued),
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// An SMS owned by an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: i64,

    pub alert_id: i64,

    /// Phone number in international format.
    pub recipient: String,

    pub body: String,

    pub status: MessageStatus,

    pub attempt_count: u32,

    pub last_error: Option<String>,

    pub next_attempt_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Inside/outside status of the patient relative to the zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    /// No fix evaluated yet.
    Unknown,
    Inside,
    Outside,
}

/// Health of the GPS link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsHealth {
    /// No fix seen since startup.
    Acquiring,
    Locked,
    /// Receiver reports no fix.
    FixLost,
    /// No valid fix within the staleness window.
    Stale,
    /// Serial device unavailable.
    Disconnected,
}

/// State of the modem link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Init,
    CheckSim,
    Registered,
    Ready,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Init => write!(f, "INIT"),
            LinkState::CheckSim => write!(f, "CHECK_SIM"),
            LinkState::Registered => write!(f, "REGISTERED"),
            LinkState::Ready => write!(f, "READY"),
        }
    }
}

/// Consistent read-only copy of the live system state.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub latest_fix: Option<LocationFix>,

    pub zone_state: ZoneState,

    /// Distance from the zone center for the latest fix.
    pub distance_m: Option<f64>,

    pub gps: GpsHealth,

    pub gsm_state: LinkState,

    pub updated_at: DateTime<Utc>,
}

impl SystemSnapshot {
    pub fn initial(latest_fix: Option<LocationFix>) -> Self {
        Self {
            latest_fix,
            zone_state: ZoneState::Unknown,
            distance_m: None,
            gps: GpsHealth::Acquiring,
            gsm_state: LinkState::Init,
            updated_at: Utc::now(),
        }
    }
}

/// Response for GET /api/current_location.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentLocationResponse {
    pub fix: LocationFix,

    pub zone_status: ZoneState,

    pub gps: GpsHealth,

    /// True when the fix came from the store rather than the live stream.
    pub from_history: bool,
}

/// Query parameters for GET /api/location_history.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Lookback window in hours (default: 24).
    #[serde(default = "default_history_hours")]
    pub hours: u32,
}

fn default_history_hours() -> u32 {
    24
}

/// Query parameters for GET /api/alerts.
#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    /// Filter by status; all statuses when absent.
    pub status: Option<AlertStatus>,
}

/// An alert together with the messages it owns.
#[derive(Debug, Clone, Serialize)]
pub struct AlertWithMessages {
    #[serde(flatten)]
    pub alert: AlertEvent,

    pub messages: Vec<OutboundMessage>,
}

/// Request body for the alert action endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertActionRequest {
    pub alert_id: i64,
}

/// Response for GET /api/geofence_status.
#[derive(Debug, Clone, Serialize)]
pub struct GeofenceStatusResponse {
    pub enabled: bool,

    pub zone: GeofenceZone,

    pub status: ZoneState,

    /// Distance from the zone center, when a fix is known.
    pub distance_m: Option<f64>,

    /// Radius minus distance: positive inside, negative outside.
    pub distance_to_boundary_m: Option<f64>,
}

/// Response for GET /api/statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsResponse {
    /// Valid fixes accepted from the receiver since startup.
    pub fixes_received: u64,

    /// Fixes stored in the database within the retention window.
    pub fixes_stored: i64,

    pub fixes_rejected: u64,

    pub sentences_bad_checksum: u64,

    pub sentences_ignored: u64,

    pub alerts_raised: i64,

    pub alerts_resolved: i64,

    pub alerts_active: i64,

    /// Confirmed returns into the zone, kept out of the alert counts.
    pub returns_confirmed: i64,

    pub messages_sent: i64,

    pub messages_failed: i64,

    pub records_dropped: u64,

    pub fixes_uploaded: u64,

    pub uploads_failed: u64,

    pub last_update: Option<DateTime<Utc>>,
}
