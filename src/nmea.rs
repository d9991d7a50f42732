//! GPS ingest: NMEA-0183 decoding and the receiver task.
//!
//! The receiver emits `GGA` and `RMC` sentences once per second. A
//! [`LocationFix`] is produced from each `GGA` with a usable quality
//! indicator; the most recent `RMC` contributes the calendar date and the
//! speed over ground. Sentences with a bad checksum, unsupported types and
//! malformed fields are dropped and counted, never treated as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::TrackerError;
use crate::geofence::haversine_m;
use crate::metrics::Metrics;
use crate::model::{FixQuality, LocationFix};
use crate::pipeline::BusEvent;
use crate::serial::{LineBuffer, read_chunk};

/// NMEA allows 82 characters per sentence; some receivers run a little over.
const MAX_SENTENCE_LEN: usize = 128;

const KNOTS_TO_MPS: f64 = 0.514_444;

/// What the ingest reports to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestSignal {
    /// A validated fix.
    Fix(LocationFix),
    /// The receiver reports no fix.
    FixLost,
    /// No valid fix within the staleness window. `ever_fixed` is false when
    /// no fix has been seen since startup.
    FixStale { ever_fixed: bool },
    /// The serial device is gone or silent; the ingest is reconnecting.
    Disconnected,
}

/// Reasons a sentence is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentenceError {
    BadChecksum,
    Unsupported,
    Malformed(&'static str),
}

/// Decoded GGA sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub time: NaiveTime,
    pub position: Option<(f64, f64)>,
    pub quality: FixQuality,
    pub satellites: u8,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
}

/// Decoded RMC sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub time: NaiveTime,
    /// Status `A`; `V` means the receiver has no fix.
    pub valid: bool,
    pub position: Option<(f64, f64)>,
    pub speed_knots: Option<f64>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
}

/// XOR of the payload bytes.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

/// Frame a payload as a complete sentence with checksum and CRLF.
pub fn frame(payload: &str) -> String {
    format!("${}*{:02X}\r\n", payload, checksum(payload.as_bytes()))
}

/// Verify and decode one sentence (without its line terminator).
pub fn parse_sentence(line: &str) -> Result<Sentence, SentenceError> {
    let body = line
        .strip_prefix('$')
        .ok_or(SentenceError::Malformed("missing $"))?;
    let (payload, expected) = body
        .rsplit_once('*')
        .ok_or(SentenceError::Malformed("missing checksum"))?;
    let expected = u8::from_str_radix(expected.trim(), 16)
        .map_err(|_| SentenceError::Malformed("checksum is not hex"))?;
    if checksum(payload.as_bytes()) != expected {
        return Err(SentenceError::BadChecksum);
    }
    if !payload.is_ascii() {
        return Err(SentenceError::Malformed("non-ASCII payload"));
    }

    let fields: Vec<&str> = payload.split(',').collect();
    let address = fields[0];
    if address.len() < 5 {
        return Err(SentenceError::Malformed("short address"));
    }
    match &address[address.len() - 3..] {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        _ => Err(SentenceError::Unsupported),
    }
}

fn parse_gga(fields: &[&str]) -> Result<Gga, SentenceError> {
    if fields.len() < 10 {
        return Err(SentenceError::Malformed("GGA field count"));
    }
    let time = parse_time(fields[1])?;
    let indicator: u8 = fields[6]
        .parse()
        .map_err(|_| SentenceError::Malformed("GGA quality"))?;
    let quality = FixQuality::from_gga(indicator);
    let position = parse_position(fields[2], fields[3], fields[4], fields[5])?;
    if quality != FixQuality::NoFix && position.is_none() {
        return Err(SentenceError::Malformed("GGA fix without position"));
    }

    Ok(Gga {
        time,
        position,
        quality,
        satellites: fields[7].parse().unwrap_or(0),
        hdop: fields[8].parse().ok(),
        altitude: fields[9].parse().ok(),
    })
}

fn parse_rmc(fields: &[&str]) -> Result<Rmc, SentenceError> {
    if fields.len() < 10 {
        return Err(SentenceError::Malformed("RMC field count"));
    }
    let time = parse_time(fields[1])?;
    let valid = match fields[2] {
        "A" => true,
        "V" => false,
        _ => return Err(SentenceError::Malformed("RMC status")),
    };
    let date = if fields[9].is_empty() {
        None
    } else {
        Some(parse_date(fields[9])?)
    };

    Ok(Rmc {
        time,
        valid,
        position: parse_position(fields[3], fields[4], fields[5], fields[6])?,
        speed_knots: fields[7].parse().ok(),
        date,
    })
}

/// `hhmmss[.sss]`
fn parse_time(field: &str) -> Result<NaiveTime, SentenceError> {
    let bad = SentenceError::Malformed("time");
    if field.len() < 6 || !field.is_char_boundary(6) {
        return Err(bad);
    }
    let h: u32 = field[0..2].parse().map_err(|_| bad.clone())?;
    let m: u32 = field[2..4].parse().map_err(|_| bad.clone())?;
    let s: u32 = field[4..6].parse().map_err(|_| bad.clone())?;
    let millis = match field[6..].strip_prefix('.') {
        Some(frac) if !frac.is_empty() => {
            let frac: f64 = format!("0.{}", frac).parse().map_err(|_| bad.clone())?;
            (frac * 1000.0).round().min(999.0) as u32
        }
        _ => 0,
    };
    NaiveTime::from_hms_milli_opt(h, m, s, millis).ok_or(bad)
}

/// `ddmmyy`
fn parse_date(field: &str) -> Result<NaiveDate, SentenceError> {
    let bad = SentenceError::Malformed("date");
    if field.len() != 6 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad);
    }
    let d: u32 = field[0..2].parse().map_err(|_| bad.clone())?;
    let m: u32 = field[2..4].parse().map_err(|_| bad.clone())?;
    let y: i32 = field[4..6].parse().map_err(|_| bad.clone())?;
    NaiveDate::from_ymd_opt(2000 + y, m, d).ok_or(bad)
}

/// Latitude `ddmm.mmmm` and longitude `dddmm.mmmm` with hemisphere letters.
/// All four fields empty means no position.
fn parse_position(
    lat: &str,
    ns: &str,
    lon: &str,
    ew: &str,
) -> Result<Option<(f64, f64)>, SentenceError> {
    if lat.is_empty() && lon.is_empty() {
        return Ok(None);
    }
    let latitude = parse_coordinate(lat, 2, 90.0)?;
    let longitude = parse_coordinate(lon, 3, 180.0)?;
    let latitude = match ns {
        "N" => latitude,
        "S" => -latitude,
        _ => return Err(SentenceError::Malformed("hemisphere")),
    };
    let longitude = match ew {
        "E" => longitude,
        "W" => -longitude,
        _ => return Err(SentenceError::Malformed("hemisphere")),
    };
    Ok(Some((latitude, longitude)))
}

fn parse_coordinate(field: &str, degree_digits: usize, limit: f64) -> Result<f64, SentenceError> {
    let bad = SentenceError::Malformed("coordinate");
    if field.len() < degree_digits + 2 || !field.is_char_boundary(degree_digits) {
        return Err(bad);
    }
    let degrees: f64 = field[..degree_digits].parse().map_err(|_| bad.clone())?;
    let minutes: f64 = field[degree_digits..].parse().map_err(|_| bad.clone())?;
    if !(0.0..60.0).contains(&minutes) {
        return Err(bad);
    }
    let value = degrees + minutes / 60.0;
    if value > limit {
        return Err(bad);
    }
    Ok(value)
}

/// Stateful decoder turning raw serial bytes into [`IngestSignal`]s.
///
/// Owns the partial-line buffer, the latest RMC, the jump filter reference
/// and the staleness clock. Survives reconnects so the monotonic-timestamp
/// guarantee spans them.
pub struct GpsDecoder {
    lines: LineBuffer,
    last_rmc: Option<Rmc>,
    last_accepted: Option<LocationFix>,
    max_speed_mps: f64,
    stale_window: Duration,
    started_at: Instant,
    last_valid_at: Option<Instant>,
    stale_reported: bool,
    lost_reported: bool,
    metrics: Arc<Metrics>,
}

impl GpsDecoder {
    pub fn new(max_speed_mps: f64, stale_window: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            lines: LineBuffer::new(MAX_SENTENCE_LEN),
            last_rmc: None,
            last_accepted: None,
            max_speed_mps,
            stale_window,
            started_at: Instant::now(),
            last_valid_at: None,
            stale_reported: false,
            lost_reported: false,
            metrics,
        }
    }

    /// Feed received bytes. `now` supplies the date until an RMC date is seen.
    pub fn feed(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Vec<IngestSignal> {
        self.lines.extend(bytes);
        let mut signals = Vec::new();

        while let Some(line) = self.lines.next_line() {
            match parse_sentence(&line) {
                Ok(Sentence::Rmc(rmc)) => {
                    if !rmc.valid {
                        signals.extend(self.fix_lost());
                    }
                    self.last_rmc = Some(rmc);
                }
                Ok(Sentence::Gga(gga)) => {
                    if gga.quality == FixQuality::NoFix {
                        signals.extend(self.fix_lost());
                    } else if let Some(fix) = self.assemble(&gga, now) {
                        signals.extend(self.accept(fix));
                    }
                }
                Err(SentenceError::BadChecksum) => {
                    Metrics::incr(&self.metrics.sentences_bad_checksum);
                    debug!(sentence = %line, "Dropping sentence with bad checksum");
                }
                Err(_) => Metrics::incr(&self.metrics.sentences_ignored),
            }
        }

        signals
    }

    /// Report staleness once per episode.
    pub fn poll_stale(&mut self, now: Instant) -> Option<IngestSignal> {
        let reference = self.last_valid_at.unwrap_or(self.started_at);
        if self.stale_reported || now.duration_since(reference) < self.stale_window {
            return None;
        }
        self.stale_reported = true;
        Some(IngestSignal::FixStale {
            ever_fixed: self.last_valid_at.is_some(),
        })
    }

    /// Drop a partial line left over from a previous connection.
    pub fn reset_line(&mut self) {
        self.lines.clear();
    }

    fn fix_lost(&mut self) -> Option<IngestSignal> {
        if self.lost_reported {
            return None;
        }
        self.lost_reported = true;
        Some(IngestSignal::FixLost)
    }

    fn assemble(&self, gga: &Gga, now: DateTime<Utc>) -> Option<LocationFix> {
        let (latitude, longitude) = gga.position?;
        let rmc = self.last_rmc.as_ref().filter(|r| r.valid);

        let date = match rmc.and_then(|r| r.date.map(|d| (d, r.time))) {
            // GGA just after midnight while the latest RMC is still from the previous day
            Some((date, rmc_time)) if rmc_time.signed_duration_since(gga.time).num_hours() >= 12 => {
                date.succ_opt()?
            }
            Some((date, _)) => date,
            None => now.date_naive(),
        };
        let speed = rmc
            .and_then(|r| r.speed_knots)
            .map(|knots| knots * KNOTS_TO_MPS)
            .unwrap_or(0.0);

        Some(LocationFix {
            timestamp: date.and_time(gga.time).and_utc(),
            latitude,
            longitude,
            altitude: gga.altitude,
            speed,
            fix_quality: gga.quality,
            satellite_count: gga.satellites,
            hdop: gga.hdop,
        })
    }

    fn accept(&mut self, fix: LocationFix) -> Option<IngestSignal> {
        if let Some(previous) = &self.last_accepted {
            if fix.timestamp < previous.timestamp {
                Metrics::incr(&self.metrics.fixes_rejected);
                debug!(timestamp = %fix.timestamp, "Rejecting fix older than the previous one");
                return None;
            }
            let elapsed = (fix.timestamp - previous.timestamp)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
                .max(1.0);
            let distance = haversine_m(
                previous.latitude,
                previous.longitude,
                fix.latitude,
                fix.longitude,
            );
            if distance / elapsed > self.max_speed_mps {
                Metrics::incr(&self.metrics.fixes_rejected);
                debug!(distance, elapsed, "Rejecting implausible position jump");
                return None;
            }
        }

        Metrics::incr(&self.metrics.fixes_received);
        self.last_accepted = Some(fix.clone());
        self.last_valid_at = Some(Instant::now());
        self.stale_reported = false;
        self.lost_reported = false;
        Some(IngestSignal::Fix(fix))
    }
}

/// The GPS receiver task.
pub struct GpsIngest {
    decoder: GpsDecoder,
    read_timeout: Duration,
    /// Consecutive silent reads before the device is considered gone.
    silence_limit: u32,
    reconnect: RetryPolicy,
}

impl GpsIngest {
    pub fn new(decoder: GpsDecoder, reconnect: RetryPolicy) -> Self {
        Self {
            decoder,
            read_timeout: Duration::from_secs(5),
            silence_limit: 3,
            reconnect,
        }
    }

    /// Read the receiver until shutdown, reconnecting through `connect`.
    pub async fn run<F, Fut, S>(
        mut self,
        mut connect: F,
        bus: mpsc::Sender<BusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<S>>,
        S: AsyncRead + Unpin,
    {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let opened = tokio::select! {
                opened = connect() => opened,
                _ = shutdown.changed() => break,
            };
            match opened {
                Ok(stream) => {
                    info!("GPS receiver connected");
                    self.decoder.reset_line();
                    match self.pump(stream, &bus, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => {
                            failures = 0;
                            warn!(error = %e, "GPS link lost");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Cannot open GPS receiver"),
            }

            if bus.send(BusEvent::Gps(IngestSignal::Disconnected)).await.is_err() {
                break;
            }

            failures = failures.saturating_add(1);
            let delay = self.reconnect.delay_for(failures);
            debug!(?delay, "Reconnecting GPS receiver");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("GPS ingest stopped");
    }

    /// Returns `Ok` on shutdown, `Err` when the link must be reopened.
    async fn pump<S>(
        &mut self,
        mut stream: S,
        bus: &mpsc::Sender<BusEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TrackerError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 256];
        let mut silent_reads = 0u32;
        let mut stale_check = tokio::time::interval(Duration::from_secs(1));
        stale_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let signals: Vec<IngestSignal> = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = stale_check.tick() => {
                    self.decoder.poll_stale(Instant::now()).into_iter().collect()
                }
                read = read_chunk(&mut stream, &mut buf, self.read_timeout) => match read {
                    Ok(0) => {
                        return Err(TrackerError::SerialIo(std::io::ErrorKind::UnexpectedEof.into()))
                    }
                    Ok(n) => {
                        silent_reads = 0;
                        self.decoder.feed(&buf[..n], Utc::now())
                    }
                    Err(TrackerError::SerialTimeout(what)) => {
                        silent_reads += 1;
                        if silent_reads >= self.silence_limit {
                            return Err(TrackerError::SerialTimeout(what));
                        }
                        Vec::new()
                    }
                    Err(e) => return Err(e),
                },
            };

            for signal in signals {
                if bus.send(BusEvent::Gps(signal)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
