//! Process-wide counters.
//!
//! Parse errors, rejected fixes and dropped records are counted here instead
//! of being logged as errors, so noisy serial links do not flood the log.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub fixes_received: AtomicU64,
    pub fixes_rejected: AtomicU64,
    pub sentences_bad_checksum: AtomicU64,
    pub sentences_ignored: AtomicU64,
    pub at_responses_malformed: AtomicU64,
    pub records_dropped: AtomicU64,
    pub fixes_uploaded: AtomicU64,
    pub uploads_failed: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
