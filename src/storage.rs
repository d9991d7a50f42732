//! SQLite storage layer for the tracker.
//!
//! # Durability
//!
//! File databases run in WAL mode with `synchronous=FULL`, and every record
//! write is a single transaction. After a crash, committed records are intact
//! and an in-flight write is simply absent; there are no partial rows.
//!
//! Timestamps are stored as Unix milliseconds.
//!
//! All writes go through the [`StoreWriter`] task so that a slow or failing
//! disk never blocks the pipeline. Readers (the dashboard) use [`Storage`]
//! directly.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{TrackerError, TrackerResult};
use crate::metrics::Metrics;
use crate::model::{
    AlertEvent, AlertKind, AlertStatus, FixQuality, LocationFix, MessageStatus, OutboundMessage,
};

/// Rows deleted per retention transaction.
pub const COMPACTION_BATCH: i64 = 500;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

/// Aggregate counts for the statistics endpoint.
///
/// Return notices (`geofence_enter_confirm`) are counted apart from alerts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreCounts {
    pub fixes: i64,
    pub alerts_raised: i64,
    pub alerts_resolved: i64,
    pub alerts_active: i64,
    pub returns_confirmed: i64,
    pub messages_sent: i64,
    pub messages_failed: i64,
    pub last_fix_at: Option<DateTime<Utc>>,
}

/// One row of the status transition log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusLogEntry {
    pub entity: String,
    pub entity_id: i64,
    pub status: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Storage {
    /// Open the database and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:patient_tracking.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> TrackerResult<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool_options = if in_memory {
            // Every connection to an in-memory database must stay alive or
            // its contents vanish.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Full);
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> TrackerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fixes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL,
                speed REAL NOT NULL,
                fix_quality TEXT NOT NULL,
                satellites INTEGER NOT NULL,
                hdop REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fixes_ts ON fixes(ts)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                zone_id TEXT,
                message TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alerts_status_created ON alerts(status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                alert_id INTEGER NOT NULL,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                last_error TEXT,
                next_attempt_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(alert_id, recipient)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS status_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write one record.
    pub async fn write(&self, record: &StoreRecord) -> TrackerResult<()> {
        match record {
            StoreRecord::Fix(fix) => self.append_fix(fix).await,
            StoreRecord::Alert(alert) => self.append_or_update_alert(alert).await,
            StoreRecord::Message(message) => self.append_or_update_message(message).await,
        }
    }

    pub async fn append_fix(&self, fix: &LocationFix) -> TrackerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fixes (ts, latitude, longitude, altitude, speed, fix_quality, satellites, hdop)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fix.timestamp.timestamp_millis())
        .bind(fix.latitude)
        .bind(fix.longitude)
        .bind(fix.altitude)
        .bind(fix.speed)
        .bind(fix.fix_quality.as_str())
        .bind(i64::from(fix.satellite_count))
        .bind(fix.hdop)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert an alert or update its mutable columns.
    ///
    /// A status change is recorded in `status_log` in the same transaction.
    pub async fn append_or_update_alert(&self, alert: &AlertEvent) -> TrackerResult<()> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<String> = sqlx::query_scalar("SELECT status FROM alerts WHERE id = ?")
            .bind(alert.id)
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO alerts (id, kind, zone_id, message, latitude, longitude, created_at, resolved_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                message = excluded.message,
                resolved_at = excluded.resolved_at,
                status = excluded.status
            "#,
        )
        .bind(alert.id)
        .bind(alert.kind.type_name())
        .bind(alert.kind.zone_id())
        .bind(&alert.message)
        .bind(alert.latitude)
        .bind(alert.longitude)
        .bind(alert.created_at.timestamp_millis())
        .bind(alert.resolved_at.map(|t| t.timestamp_millis()))
        .bind(alert.status.as_str())
        .execute(&mut *tx)
        .await?;

        if previous.as_deref() != Some(alert.status.as_str()) {
            let at = alert.resolved_at.unwrap_or_else(Utc::now);
            log_status(&mut tx, "alert", alert.id, alert.status.as_str(), None, at).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert a message or update its delivery columns.
    pub async fn append_or_update_message(&self, message: &OutboundMessage) -> TrackerResult<()> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT status FROM messages WHERE id = ?")
                .bind(message.id)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, alert_id, recipient, body, status, attempt_count, last_error, next_attempt_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error,
                next_attempt_at = excluded.next_attempt_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(message.id)
        .bind(message.alert_id)
        .bind(&message.recipient)
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(i64::from(message.attempt_count))
        .bind(&message.last_error)
        .bind(message.next_attempt_at.timestamp_millis())
        .bind(message.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if previous.as_deref() != Some(message.status.as_str()) {
            log_status(
                &mut tx,
                "message",
                message.id,
                message.status.as_str(),
                message.last_error.as_deref(),
                message.updated_at,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fixes with `from <= ts <= to`, oldest first.
    pub async fn fixes_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TrackerResult<Vec<LocationFix>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, latitude, longitude, altitude, speed, fix_quality, satellites, hdop
            FROM fixes
            WHERE ts >= ? AND ts <= ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(fix_from_row).collect()
    }

    pub async fn latest_fix(&self) -> TrackerResult<Option<LocationFix>> {
        let row = sqlx::query(
            r#"
            SELECT ts, latitude, longitude, altitude, speed, fix_quality, satellites, hdop
            FROM fixes
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(fix_from_row).transpose()
    }

    /// Alerts newest first, optionally filtered by status.
    pub async fn alerts_by_status(
        &self,
        status: Option<AlertStatus>,
        limit: i64,
    ) -> TrackerResult<Vec<AlertEvent>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, kind, zone_id, message, latitude, longitude, created_at, resolved_at, status
            FROM alerts
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    pub async fn alert_by_id(&self, id: i64) -> TrackerResult<Option<AlertEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, zone_id, message, latitude, longitude, created_at, resolved_at, status
            FROM alerts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    /// Open and acknowledged alerts, oldest first.
    pub async fn active_alerts(&self) -> TrackerResult<Vec<AlertEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, zone_id, message, latitude, longitude, created_at, resolved_at, status
            FROM alerts
            WHERE status != 'resolved'
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    pub async fn messages_by_alert(&self, alert_id: i64) -> TrackerResult<Vec<OutboundMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, recipient, body, status, attempt_count, last_error, next_attempt_at, updated_at
            FROM messages
            WHERE alert_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Messages still waiting for delivery, in send order.
    pub async fn pending_messages(&self) -> TrackerResult<Vec<OutboundMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, recipient, body, status, attempt_count, last_error, next_attempt_at, updated_at
            FROM messages
            WHERE status = 'queued'
            ORDER BY next_attempt_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Highest alert and message ids in use, 0 when empty.
    pub async fn max_ids(&self) -> TrackerResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COALESCE(MAX(id), 0) FROM alerts) AS max_alert,
                (SELECT COALESCE(MAX(id), 0) FROM messages) AS max_message
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("max_alert")?, row.try_get("max_message")?))
    }

    pub async fn counts(&self) -> TrackerResult<StoreCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM fixes) AS fixes,
                (SELECT MAX(ts) FROM fixes) AS last_fix_ts,
                (SELECT COUNT(*) FROM alerts WHERE kind != 'geofence_enter_confirm') AS alerts_raised,
                (SELECT COUNT(*) FROM alerts
                    WHERE kind != 'geofence_enter_confirm' AND status = 'resolved') AS alerts_resolved,
                (SELECT COUNT(*) FROM alerts
                    WHERE kind != 'geofence_enter_confirm' AND status != 'resolved') AS alerts_active,
                (SELECT COUNT(*) FROM alerts WHERE kind = 'geofence_enter_confirm') AS returns_confirmed,
                (SELECT COUNT(*) FROM messages WHERE status = 'sent') AS messages_sent,
                (SELECT COUNT(*) FROM messages WHERE status = 'failed') AS messages_failed
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let last_fix_ts: Option<i64> = row.try_get("last_fix_ts")?;

        Ok(StoreCounts {
            fixes: row.try_get("fixes")?,
            alerts_raised: row.try_get("alerts_raised")?,
            alerts_resolved: row.try_get("alerts_resolved")?,
            alerts_active: row.try_get("alerts_active")?,
            returns_confirmed: row.try_get("returns_confirmed")?,
            messages_sent: row.try_get("messages_sent")?,
            messages_failed: row.try_get("messages_failed")?,
            last_fix_at: last_fix_ts.map(from_millis).transpose()?,
        })
    }

    /// Return messages interrupted mid-send to the queue.
    ///
    /// A message left `sending` by a previous run may or may not have gone
    /// out; it is sent again rather than lost.
    pub async fn recover_interrupted_sends(&self) -> TrackerResult<u64> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE status = 'sending'")
            .fetch_all(&mut *tx)
            .await?;

        for id in &ids {
            sqlx::query("UPDATE messages SET status = 'queued', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO status_log (entity, entity_id, status, detail, ts) VALUES ('message', ?, 'queued', 'recovered after restart', ?)",
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    /// Delete up to `batch` fixes older than `cutoff` in one transaction.
    pub async fn compact_fixes(&self, cutoff: DateTime<Utc>, batch: i64) -> TrackerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM fixes
            WHERE id IN (SELECT id FROM fixes WHERE ts < ? ORDER BY id LIMIT ?)
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .bind(batch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Status transitions of one alert or message, oldest first.
    pub async fn status_log(&self, entity: &str, entity_id: i64) -> TrackerResult<Vec<StatusLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT entity, entity_id, status, detail, ts
            FROM status_log
            WHERE entity = ? AND entity_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(entity)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StatusLogEntry {
                    entity: row.try_get("entity")?,
                    entity_id: row.try_get("entity_id")?,
                    status: row.try_get("status")?,
                    detail: row.try_get("detail")?,
                    timestamp: from_millis(row.try_get("ts")?)?,
                })
            })
            .collect()
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn log_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entity: &str,
    entity_id: i64,
    status: &str,
    detail: Option<&str>,
    at: DateTime<Utc>,
) -> TrackerResult<()> {
    sqlx::query(
        "INSERT INTO status_log (entity, entity_id, status, detail, ts) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entity)
    .bind(entity_id)
    .bind(status)
    .bind(detail)
    .bind(at.timestamp_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode_error(what: String) -> TrackerError {
    TrackerError::Persistence(sqlx::Error::Decode(what.into()))
}

fn from_millis(ms: i64) -> TrackerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| decode_error(format!("timestamp {ms} out of range")))
}

fn fix_from_row(row: &SqliteRow) -> TrackerResult<LocationFix> {
    let quality: String = row.try_get("fix_quality")?;
    let satellites: i64 = row.try_get("satellites")?;

    Ok(LocationFix {
        timestamp: from_millis(row.try_get("ts")?)?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        altitude: row.try_get("altitude")?,
        speed: row.try_get("speed")?,
        fix_quality: FixQuality::parse(&quality)
            .ok_or_else(|| decode_error(format!("unknown fix quality {quality:?}")))?,
        satellite_count: u8::try_from(satellites).unwrap_or(u8::MAX),
        hdop: row.try_get("hdop")?,
    })
}

fn alert_from_row(row: &SqliteRow) -> TrackerResult<AlertEvent> {
    let kind: String = row.try_get("kind")?;
    let zone_id: Option<String> = row.try_get("zone_id")?;
    let status: String = row.try_get("status")?;
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;

    Ok(AlertEvent {
        id: row.try_get("id")?,
        kind: AlertKind::from_parts(&kind, zone_id)
            .ok_or_else(|| decode_error(format!("unknown alert kind {kind:?}")))?,
        message: row.try_get("message")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        resolved_at: resolved_at.map(from_millis).transpose()?,
        status: AlertStatus::parse(&status)
            .ok_or_else(|| decode_error(format!("unknown alert status {status:?}")))?,
    })
}

fn message_from_row(row: &SqliteRow) -> TrackerResult<OutboundMessage> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempt_count")?;

    Ok(OutboundMessage {
        id: row.try_get("id")?,
        alert_id: row.try_get("alert_id")?,
        recipient: row.try_get("recipient")?,
        body: row.try_get("body")?,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| decode_error(format!("unknown message status {status:?}")))?,
        attempt_count: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        next_attempt_at: from_millis(row.try_get("next_attempt_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

/// A record queued for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRecord {
    Fix(LocationFix),
    Alert(AlertEvent),
    Message(OutboundMessage),
}

impl StoreRecord {
    fn label(&self) -> &'static str {
        match self {
            StoreRecord::Fix(_) => "fix",
            StoreRecord::Alert(_) => "alert",
            StoreRecord::Message(_) => "message",
        }
    }
}

/// Single writer for all store mutations.
///
/// Records are applied in arrival order. While the store fails, records wait
/// in a bounded backlog; when the backlog is full the oldest record is
/// dropped and counted in `records_dropped`.
pub struct StoreWriter {
    storage: Storage,
    backlog: VecDeque<StoreRecord>,
    capacity: usize,
    retry: RetryPolicy,
    failures: u32,
    retry_at: Option<Instant>,
    metrics: Arc<Metrics>,
    retention: chrono::Duration,
    compaction_interval: Duration,
}

impl StoreWriter {
    pub fn new(
        storage: Storage,
        capacity: usize,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            storage,
            backlog: VecDeque::new(),
            capacity: capacity.max(1),
            retry,
            failures: 0,
            retry_at: None,
            metrics,
            retention,
            compaction_interval: Duration::from_secs(3600),
        }
    }

    /// Apply records until every sender is gone.
    ///
    /// The writer does not watch the shutdown signal itself: it stops once
    /// the pipeline has dropped its sender, so records the pipeline emits
    /// while draining are still written.
    pub async fn run(mut self, mut records: mpsc::Receiver<StoreRecord>) {
        let mut compaction = tokio::time::interval(self.compaction_interval);
        compaction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            while let Ok(record) = records.try_recv() {
                self.push(record);
            }
            if self.retry_at.is_none() && self.write_front().await {
                continue;
            }

            let wake = self.retry_at;
            let retry = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                record = records.recv() => match record {
                    Some(record) => self.push(record),
                    None => break,
                },
                _ = retry => self.retry_at = None,
                _ = compaction.tick() => self.compact(&mut records).await,
            }
        }

        self.flush_on_exit(&mut records).await;
        debug!("Store writer stopped");
    }

    fn push(&mut self, record: StoreRecord) {
        if self.backlog.len() >= self.capacity {
            if let Some(dropped) = self.backlog.pop_front() {
                Metrics::incr(&self.metrics.records_dropped);
                warn!(
                    record = dropped.label(),
                    backlog = self.backlog.len(),
                    "Store backlog full, dropping oldest record"
                );
            }
        }
        self.backlog.push_back(record);
    }

    /// Try to write the oldest pending record. Returns true when one was consumed.
    async fn write_front(&mut self) -> bool {
        let Some(record) = self.backlog.front() else {
            return false;
        };

        match self.storage.write(record).await {
            Ok(()) => {
                if self.failures > 0 {
                    info!(failures = self.failures, "Store writes recovered");
                }
                self.failures = 0;
                self.backlog.pop_front();
                true
            }
            Err(e) => {
                self.failures += 1;
                if self.retry.exhausted(self.failures) {
                    error!(
                        error = %e,
                        record = record.label(),
                        attempts = self.failures,
                        "Giving up on record"
                    );
                    Metrics::incr(&self.metrics.records_dropped);
                    self.backlog.pop_front();
                    self.failures = 0;
                    return true;
                }
                let delay = self.retry.delay_for(self.failures);
                warn!(
                    error = %e,
                    record = record.label(),
                    attempt = self.failures,
                    ?delay,
                    "Store write failed, retrying"
                );
                self.retry_at = Some(Instant::now() + delay);
                false
            }
        }
    }

    /// Delete expired fixes in small batches, applying foreground writes between batches.
    async fn compact(&mut self, records: &mut mpsc::Receiver<StoreRecord>) {
        let cutoff = Utc::now() - self.retention;
        let mut total = 0u64;

        loop {
            match self.storage.compact_fixes(cutoff, COMPACTION_BATCH).await {
                Ok(deleted) => {
                    total += deleted;
                    if deleted < COMPACTION_BATCH as u64 {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Retention compaction failed");
                    break;
                }
            }

            while let Ok(record) = records.try_recv() {
                self.push(record);
            }
            while self.retry_at.is_none() && self.write_front().await {}
        }

        if total > 0 {
            info!(deleted = total, cutoff = %cutoff, "Expired fixes removed");
        }
    }

    async fn flush_on_exit(&mut self, records: &mut mpsc::Receiver<StoreRecord>) {
        while let Ok(record) = records.try_recv() {
            self.push(record);
        }
        while let Some(record) = self.backlog.pop_front() {
            if let Err(e) = self.storage.write(&record).await {
                Metrics::incr(&self.metrics.records_dropped);
                warn!(error = %e, record = record.label(), "Record lost at shutdown");
            }
        }
    }
}
