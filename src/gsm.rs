//! GSM modem link: AT command session and SMS delivery.
//!
//! The link walks `INIT → CHECK_SIM → REGISTERED → READY` and serves the
//! outbound queue only while READY, one message at a time. Anything that
//! suggests the modem is gone (a timeout, a serial error, an unsolicited
//! `RDY`) drops the link back to INIT; queued messages are kept and go out
//! once the link is READY again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{TrackerError, TrackerResult};
use crate::metrics::Metrics;
use crate::model::{LinkState, MessageStatus, OutboundMessage};
use crate::pipeline::BusEvent;
use crate::serial::LineBuffer;

/// Longest SMS body sent in text mode.
pub const MAX_SMS_CHARS: usize = 160;

const CTRL_Z: u8 = 0x1A;
const ESC: char = '\u{1b}';

/// Updates published by the link task.
#[derive(Debug, Clone, PartialEq)]
pub enum GsmEvent {
    LinkChanged(LinkState),
    MessageUpdate(OutboundMessage),
}

/// Terminal line of an AT response.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Final {
    Ok,
    Error(String),
}

fn final_result(line: &str) -> Option<Final> {
    match line {
        "OK" => Some(Final::Ok),
        "ERROR" => Some(Final::Error(line.to_string())),
        _ if line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR") => {
            Some(Final::Error(line.to_string()))
        }
        _ => None,
    }
}

/// Unsolicited result codes that mean the modem restarted.
pub fn is_reset_notice(line: &str) -> bool {
    line == "RDY" || line.starts_with("+CFUN:")
}

/// Registration status from an `AT+CREG?` response.
///
/// Accepts both `+CREG: <n>,<stat>` and the unsolicited `+CREG: <stat>`.
pub fn parse_creg(line: &str) -> Option<u8> {
    let fields = line.strip_prefix("+CREG:")?.trim();
    let mut parts = fields.split(',').map(str::trim);
    let first = parts.next()?;
    let stat = parts.next().unwrap_or(first);
    stat.parse().ok()
}

/// Strip characters that would end or escape text-mode input, then truncate.
pub fn sanitize_body(body: &str) -> String {
    body.chars()
        .filter(|&c| c != CTRL_Z as char && c != ESC)
        .filter(|&c| c == '\n' || !c.is_control())
        .take(MAX_SMS_CHARS)
        .collect()
}

/// A command/response session over a modem byte stream.
pub struct AtSession<S> {
    stream: S,
    lines: LineBuffer,
    command_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl<S> AtSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, command_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            stream,
            lines: LineBuffer::new(512),
            command_timeout,
            metrics,
        }
    }

    /// Send a command and collect the information lines of its response.
    ///
    /// The command echo is skipped. `ERROR`, `+CME ERROR` and `+CMS ERROR`
    /// become [`TrackerError::ModemRejected`].
    pub async fn command(&mut self, command: &str) -> TrackerResult<Vec<String>> {
        debug!(command, "AT >");
        self.write(format!("{command}\r").as_bytes()).await?;
        let deadline = Instant::now() + self.command_timeout;
        self.read_response(Some(command), deadline).await
    }

    /// Send one SMS in text mode. Returns the message reference if reported.
    pub async fn send_sms(
        &mut self,
        number: &str,
        body: &str,
        timeout: Duration,
    ) -> TrackerResult<Option<u32>> {
        let deadline = Instant::now() + timeout;
        let command = format!("AT+CMGS=\"{number}\"");
        debug!(command = %command, "AT >");
        self.write(format!("{command}\r").as_bytes()).await?;

        self.wait_for_prompt(&command, deadline).await?;

        let mut payload = body.as_bytes().to_vec();
        payload.push(CTRL_Z);
        self.write(&payload).await?;

        let lines = self.read_response(Some(body), deadline).await?;
        let reference = lines
            .iter()
            .find_map(|l| l.strip_prefix("+CMGS:"))
            .and_then(|r| r.trim().parse().ok());
        if reference.is_none() {
            Metrics::incr(&self.metrics.at_responses_malformed);
            debug!("SMS accepted without a +CMGS reference");
        }
        Ok(reference)
    }

    /// Wait for data from the modem outside of a command.
    ///
    /// Returns the complete lines received. Cancel safe.
    pub async fn poll_unsolicited(&mut self) -> TrackerResult<Vec<String>> {
        let mut buf = [0u8; 256];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TrackerError::SerialIo(std::io::ErrorKind::UnexpectedEof.into()));
        }
        self.lines.extend(&buf[..n]);

        let mut lines = Vec::new();
        while let Some(line) = self.lines.next_line() {
            lines.push(line.trim().to_string());
        }
        Ok(lines)
    }

    async fn write(&mut self, bytes: &[u8]) -> TrackerResult<()> {
        match tokio::time::timeout(self.command_timeout, async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(TrackerError::SerialTimeout("modem write".into())),
        }
    }

    async fn fill(&mut self, deadline: Instant, waiting_for: &str) -> TrackerResult<()> {
        let mut buf = [0u8; 256];
        match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => Err(TrackerError::SerialIo(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Ok(n)) => {
                self.lines.extend(&buf[..n]);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TrackerError::SerialTimeout(waiting_for.to_string())),
        }
    }

    async fn wait_for_prompt(&mut self, command: &str, deadline: Instant) -> TrackerResult<()> {
        loop {
            while let Some(line) = self.lines.next_line() {
                let line = line.trim();
                if line == command {
                    continue;
                }
                if let Some(Final::Error(e)) = final_result(line) {
                    return Err(TrackerError::ModemRejected(e));
                }
                if is_reset_notice(line) {
                    return Err(TrackerError::ModemNotReady("modem restarted".into()));
                }
            }
            if self.lines.take_through(b'>') {
                return Ok(());
            }
            self.fill(deadline, "SMS prompt").await?;
        }
    }

    async fn read_response(
        &mut self,
        echo: Option<&str>,
        deadline: Instant,
    ) -> TrackerResult<Vec<String>> {
        let mut info = Vec::new();
        loop {
            while let Some(line) = self.lines.next_line() {
                let line = line.trim();
                if echo.is_some_and(|e| e.trim() == line) {
                    continue;
                }
                match final_result(line) {
                    Some(Final::Ok) => {
                        debug!(lines = info.len(), "AT < OK");
                        return Ok(info);
                    }
                    Some(Final::Error(e)) => return Err(TrackerError::ModemRejected(e)),
                    None if is_reset_notice(line) => {
                        return Err(TrackerError::ModemNotReady("modem restarted".into()));
                    }
                    None => info.push(line.to_string()),
                }
            }
            self.fill(deadline, "modem response").await?;
        }
    }
}

/// Link timing and retry settings.
#[derive(Debug, Clone)]
pub struct GsmSettings {
    pub command_timeout: Duration,
    pub sms_timeout: Duration,
    pub probe_interval: Duration,
    pub sms_retry: RetryPolicy,
    pub link_retry: RetryPolicy,
}

struct Pending {
    message: OutboundMessage,
    due: Instant,
}

/// The modem link task.
pub struct GsmLink {
    settings: GsmSettings,
    metrics: Arc<Metrics>,
    state: LinkState,
    queue: Vec<Pending>,
}

impl GsmLink {
    pub fn new(settings: GsmSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            settings,
            metrics,
            state: LinkState::Init,
            queue: Vec::new(),
        }
    }

    /// Drive the modem until shutdown or until the outbound channel closes.
    pub async fn run<F, Fut, S>(
        mut self,
        mut connect: F,
        mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
        bus: mpsc::Sender<BusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<S>>,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect().await {
                Ok(stream) => {
                    let mut session =
                        AtSession::new(stream, self.settings.command_timeout, self.metrics.clone());
                    match self.bring_up(&mut session, &bus).await {
                        Ok(()) => {
                            failures = 0;
                            match self.serve(&mut session, &mut outbound, &bus, &mut shutdown).await {
                                Ok(()) => break,
                                Err(e) => warn!(error = %e, "Modem link lost"),
                            }
                        }
                        Err(e) => warn!(error = %e, state = %self.state, "Modem bring-up failed"),
                    }
                }
                Err(e) => warn!(error = %e, "Cannot open modem"),
            }

            self.set_state(LinkState::Init, &bus).await;

            failures = failures.saturating_add(1);
            let delay = self.settings.link_retry.delay_for(failures);
            debug!(?delay, queued = self.queue.len(), "Retrying modem link");
            if !self.wait(delay, &mut outbound, &mut shutdown).await {
                break;
            }
        }

        debug!(queued = self.queue.len(), "GSM link stopped");
    }

    /// Sleep while still accepting outbound messages. False on shutdown.
    async fn wait(
        &mut self,
        delay: Duration,
        outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                message = outbound.recv() => match message {
                    Some(message) => self.enqueue(message),
                    None => return false,
                },
                _ = shutdown.changed() => return false,
            }
        }
    }

    async fn bring_up<S>(
        &mut self,
        session: &mut AtSession<S>,
        bus: &mpsc::Sender<BusEvent>,
    ) -> TrackerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_state(LinkState::Init, bus).await;
        session.command("AT").await?;
        if let Err(e) = session.command("ATE0").await {
            debug!(error = %e, "Echo could not be disabled");
        }

        self.set_state(LinkState::CheckSim, bus).await;
        let sim = session.command("AT+CPIN?").await?;
        if !sim.iter().any(|l| l.starts_with("+CPIN:") && l.ends_with("READY")) {
            return Err(TrackerError::ModemNotReady(format!("SIM not ready: {sim:?}")));
        }

        let registration = session.command("AT+CREG?").await?;
        let stat = registration.iter().find_map(|l| parse_creg(l));
        match stat {
            Some(1) | Some(5) => {}
            Some(stat) => {
                return Err(TrackerError::ModemNotReady(format!(
                    "not registered (stat {stat})"
                )));
            }
            None => {
                Metrics::incr(&self.metrics.at_responses_malformed);
                return Err(TrackerError::ProtocolParse(format!(
                    "unexpected AT+CREG? response: {registration:?}"
                )));
            }
        }
        self.set_state(LinkState::Registered, bus).await;

        session.command("AT+CMGF=1").await?;
        self.set_state(LinkState::Ready, bus).await;
        Ok(())
    }

    /// Serve the queue while READY. `Ok` on shutdown, `Err` when the link dropped.
    async fn serve<S>(
        &mut self,
        session: &mut AtSession<S>,
        outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
        bus: &mpsc::Sender<BusEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TrackerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let period = self.settings.probe_interval;
        let mut probe = tokio::time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            // Messages raised during the previous send compete for the next slot
            while let Ok(message) = outbound.try_recv() {
                self.enqueue(message);
            }

            if let Some(pending) = self.take_due(Instant::now()) {
                self.deliver(session, pending, bus).await?;
                probe.reset();
                continue;
            }

            let wake = self.queue.iter().map(|p| p.due).min();
            let due = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => self.enqueue(message),
                    None => return Ok(()),
                },
                _ = due => {}
                _ = probe.tick() => {
                    session.command("AT").await?;
                    debug!("Modem probe OK");
                }
                lines = session.poll_unsolicited() => {
                    for line in lines? {
                        if is_reset_notice(&line) {
                            return Err(TrackerError::ModemNotReady(format!("modem reset ({line})")));
                        }
                        debug!(line = %line, "Unsolicited modem output");
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Attempt one delivery. Errors that mean the link is gone are returned.
    async fn deliver<S>(
        &mut self,
        session: &mut AtSession<S>,
        pending: Pending,
        bus: &mpsc::Sender<BusEvent>,
    ) -> TrackerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut message = pending.message;
        message.status = MessageStatus::Sending;
        message.attempt_count += 1;
        message.updated_at = Utc::now();
        report(bus, &message).await;

        let body = sanitize_body(&message.body);
        let result = session
            .send_sms(&message.recipient, &body, self.settings.sms_timeout)
            .await;

        match result {
            Ok(reference) => {
                message.status = MessageStatus::Sent;
                message.last_error = None;
                message.updated_at = Utc::now();
                info!(
                    message_id = message.id,
                    alert_id = message.alert_id,
                    attempt = message.attempt_count,
                    reference = ?reference,
                    "SMS sent"
                );
                report(bus, &message).await;
                Ok(())
            }
            Err(e) => {
                let now = Utc::now();
                message.last_error = Some(e.to_string());
                message.updated_at = now;

                if self.settings.sms_retry.exhausted(message.attempt_count) {
                    message.status = MessageStatus::Failed;
                    error!(
                        message_id = message.id,
                        alert_id = message.alert_id,
                        attempts = message.attempt_count,
                        error = %e,
                        "SMS delivery failed permanently"
                    );
                    report(bus, &message).await;
                } else {
                    let delay = self.settings.sms_retry.delay_for(message.attempt_count);
                    message.status = MessageStatus::Queued;
                    message.next_attempt_at =
                        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    warn!(
                        message_id = message.id,
                        attempt = message.attempt_count,
                        ?delay,
                        error = %e,
                        "SMS attempt failed, rescheduled"
                    );
                    report(bus, &message).await;
                    self.queue.push(Pending {
                        message,
                        due: Instant::now() + delay,
                    });
                }

                match e {
                    TrackerError::ModemRejected(_) => Ok(()),
                    other => Err(other),
                }
            }
        }
    }

    /// Queue messages left pending by a previous run.
    pub fn restore(&mut self, pending: Vec<OutboundMessage>) {
        if !pending.is_empty() {
            info!(count = pending.len(), "Re-queueing undelivered messages");
        }
        for message in pending {
            self.enqueue(message);
        }
    }

    fn enqueue(&mut self, message: OutboundMessage) {
        let wait = (message.next_attempt_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(message_id = message.id, ?wait, "SMS queued");
        self.queue.retain(|p| p.message.id != message.id);
        self.queue.push(Pending {
            message,
            due: Instant::now() + wait,
        });
    }

    /// Remove the earliest due message, oldest id first on ties.
    fn take_due(&mut self, now: Instant) -> Option<Pending> {
        let index = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= now)
            .min_by_key(|(_, p)| (p.due, p.message.id))
            .map(|(i, _)| i)?;
        Some(self.queue.remove(index))
    }

    async fn set_state(&mut self, state: LinkState, bus: &mpsc::Sender<BusEvent>) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Modem link state changed");
        self.state = state;
        let _ = bus.send(BusEvent::Gsm(GsmEvent::LinkChanged(state))).await;
    }
}

async fn report(bus: &mpsc::Sender<BusEvent>, message: &OutboundMessage) {
    if bus
        .send(BusEvent::Gsm(GsmEvent::MessageUpdate(message.clone())))
        .await
        .is_err()
    {
        debug!(message_id = message.id, "Pipeline gone, status update not delivered");
    }
}
