//! Patient Tracker - single-patient GPS tracking with geofence alerts over SMS.
//!
//! # Overview
//!
//! A GPS receiver and a GSM modem are attached over serial lines. Position
//! fixes are checked against a circular safe zone; when the patient leaves
//! it, caregivers receive an SMS and the event shows up on a local HTTP
//! dashboard. Alerts are deduplicated per condition and zone, and SMS
//! delivery survives modem resets, retries with backoff, and restarts.
//!
//! # Pipeline
//!
//! ```text
//! GPS serial ─► nmea ─┐
//! SOS input ──────────┼─► pipeline ─► geofence ─► alerting ─┬─► gsm ─► modem
//! dashboard commands ─┘      │                              └─► storage
//!                            └─► snapshot ─► api
//! ```
//!
//! # Modules
//!
//! - [`model`]: Data types for fixes, zones, alerts and messages
//! - [`nmea`]: NMEA-0183 parsing and the GPS ingest task
//! - [`geofence`]: Distance computation and hysteresis
//! - [`alerting`]: Alert lifecycle and deduplication
//! - [`gsm`]: AT command session and the modem link task
//! - [`storage`]: SQLite storage layer and the store writer task
//! - [`pipeline`]: Event bus and live state
//! - [`api`]: HTTP API handlers
//! - [`uploader`]: Optional upload of fixes to a remote server
//! - [`runtime`]: Task wiring and shutdown

pub mod alerting;
pub mod api;
pub mod config;
pub mod error;
pub mod geofence;
pub mod gsm;
pub mod metrics;
pub mod model;
pub mod nmea;
pub mod pipeline;
pub mod runtime;
pub mod serial;
pub mod sos;
pub mod storage;
pub mod uploader;
