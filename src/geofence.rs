//! Geofence evaluation with hysteresis.
//!
//! The evaluator remembers only the last inside/outside decision. A
//! transition is reported when a fix crosses the far side of the dead-band:
//! leaving requires a distance above `radius * (1 + h)`, returning requires a
//! distance below `radius * (1 - h)`. Fixes inside the band keep the current
//! state, so a patient standing on the boundary does not flap.

use serde::Serialize;

use crate::model::{GeofenceZone, LocationFix, ZoneState};

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

/// A change of zone membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneTransition {
    Enter,
    Exit,
}

/// Result of evaluating one fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub distance_m: f64,

    /// State after this fix.
    pub state: ZoneState,

    /// Set only when the state changed.
    pub transition: Option<ZoneTransition>,

    /// The fix lies inside the inner boundary and confirms a return.
    pub within_inner: bool,
}

/// Tracks zone membership for one zone.
#[derive(Debug, Clone)]
pub struct GeofenceEvaluator {
    zone: GeofenceZone,
    state: ZoneState,
}

impl GeofenceEvaluator {
    pub fn new(zone: GeofenceZone) -> Self {
        Self {
            zone,
            state: ZoneState::Unknown,
        }
    }

    pub fn zone(&self) -> &GeofenceZone {
        &self.zone
    }

    pub fn state(&self) -> ZoneState {
        self.state
    }

    pub fn distance_to(&self, fix: &LocationFix) -> f64 {
        haversine_m(
            fix.latitude,
            fix.longitude,
            self.zone.latitude,
            self.zone.longitude,
        )
    }

    /// Evaluate a fix. Returns `None` when the zone is disabled.
    ///
    /// The first fix after startup is judged against the plain radius; a
    /// patient who is already outside at that point produces an exit.
    pub fn evaluate(&mut self, fix: &LocationFix) -> Option<Evaluation> {
        if !self.zone.enabled {
            return None;
        }

        let distance_m = self.distance_to(fix);
        let within_inner = distance_m < self.zone.inner_radius();

        let next = match self.state {
            ZoneState::Unknown if distance_m <= self.zone.radius_m => ZoneState::Inside,
            ZoneState::Unknown => ZoneState::Outside,
            ZoneState::Inside if distance_m > self.zone.outer_radius() => ZoneState::Outside,
            ZoneState::Outside if within_inner => ZoneState::Inside,
            current => current,
        };

        let transition = match (self.state, next) {
            (ZoneState::Inside, ZoneState::Outside) | (ZoneState::Unknown, ZoneState::Outside) => {
                Some(ZoneTransition::Exit)
            }
            (ZoneState::Outside, ZoneState::Inside) => Some(ZoneTransition::Enter),
            _ => None,
        };

        self.state = next;

        Some(Evaluation {
            distance_m,
            state: next,
            transition,
            within_inner,
        })
    }
}

/// Point `meters` due north of the given position.
///
/// Used to build test tracks at exact distances from a zone center.
pub fn offset_north(latitude: f64, longitude: f64, meters: f64) -> (f64, f64) {
    (latitude + (meters / EARTH_RADIUS_M).to_degrees(), longitude)
}
