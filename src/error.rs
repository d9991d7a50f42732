//! Error taxonomy for the tracker.
//!
//! Only configuration errors are fatal, and only at startup. Everything that
//! originates in sensor ingestion or modem I/O is transient: it is retried,
//! counted, or reported back to the caller, but never terminates the process.

use thiserror::Error;

/// Errors raised by the tracker components.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Serial read/write failure or timeout. Retried with the component's backoff.
    #[error("Serial I/O error: {0}")]
    SerialIo(#[from] std::io::Error),

    /// Serial operation did not complete within its deadline.
    #[error("Serial timeout while waiting for {0}")]
    SerialTimeout(String),

    /// Bad checksum, malformed sentence or malformed AT response.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// The modem link is not in the READY state.
    #[error("Modem not ready: {0}")]
    ModemNotReady(String),

    /// The modem answered a command with an error.
    #[error("Modem rejected command: {0}")]
    ModemRejected(String),

    /// Invalid geofence coordinates or radius.
    #[error("Geofence configuration error: {0}")]
    GeofenceConfig(String),

    /// Any other invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store read or write failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Requested record does not exist.
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: i64 },

    /// Requested status change is not allowed from the current status.
    #[error("Cannot move alert {id} from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: String,
    },

    /// Remote fix upload failure.
    #[error("Upload error: {0}")]
    Upload(#[from] reqwest::Error),

    /// A pipeline channel closed because its task has stopped.
    #[error("Pipeline unavailable: {0}")]
    ChannelClosed(&'static str),
}

impl TrackerError {
    /// Errors that are fatal when raised during startup validation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrackerError::GeofenceConfig(_) | TrackerError::Config(_)
        )
    }
}

/// Result type alias for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(TrackerError::GeofenceConfig("radius".into()).is_fatal());
        assert!(TrackerError::Config("port".into()).is_fatal());
        assert!(!TrackerError::SerialTimeout("OK".into()).is_fatal());
        assert!(!TrackerError::ModemNotReady("INIT".into()).is_fatal());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = TrackerError::InvalidTransition {
            id: 7,
            from: "resolved".into(),
            to: "acknowledged".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot move alert 7 from resolved to acknowledged"
        );
    }
}
