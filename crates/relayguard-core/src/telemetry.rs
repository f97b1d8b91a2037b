//! Transport telemetry: decoding `srt-live-transmit` output and tracking
//! link state.
//!
//! The transport prints one line per event. A line that decodes as a JSON
//! stats object becomes a [`MetricsRecord`]; anything else is a text
//! message, scanned for three trigger strings:
//!
//! - **connected**: Disconnected → Connected
//! - **disconnected**: Connected → Disconnected
//! - **clock fault**: restart the transport once
//!
//! The collector publishes an immutable [`TelemetrySnapshot`] through a
//! `watch` channel after each tick, so readers always see metrics,
//! message, connection state and timestamp from the same tick.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::error::{ConfigError, DecodeError, SupervisorError};
use crate::supervisor::{ProcessSupervisor, Supervised, epoch_ms};

// =============================================================================
// Decoded lines
// =============================================================================

/// One stats sample from the transport.
///
/// Superseded wholesale by the next record; never merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    /// Opaque socket/session id
    pub session_id: Option<String>,
    /// Round-trip time; `None` when absent or negative.
    pub rtt_ms: Option<f64>,
    /// Estimated link bandwidth
    pub bandwidth_mbps: Option<f64>,
    pub send_mbps: Option<f64>,
    pub recv_mbps: Option<f64>,
    pub send_packets_lost: u64,
    pub recv_packets_lost: u64,
    pub send_packets_dropped: u64,
    pub recv_packets_dropped: u64,
    pub send_packets_retransmitted: u64,
    pub flow_window: u64,
    pub flight_window: u64,
    /// Wall-clock time the line was decoded.
    pub observed_at_ms: u64,
}

impl MetricsRecord {
    /// Larger of send/receive rate; `None` when both are zero or missing.
    ///
    /// The transport reports throughput on only one side depending on
    /// direction, and reads 0/0 for single ticks without meaning it.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let send = self.send_mbps.unwrap_or(0.0);
        let recv = self.recv_mbps.unwrap_or(0.0);
        let best = send.max(recv);
        (best > 0.0).then_some(best)
    }
}

/// A decoded line of transport output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawLine {
    Metrics(MetricsRecord),
    Message(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireStats {
    sid: Option<serde_json::Value>,
    link: WireLink,
    window: WireWindow,
    send: WireDirection,
    recv: WireDirection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireLink {
    rtt: Option<f64>,
    bandwidth: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireWindow {
    flow: Option<i64>,
    flight: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireDirection {
    mbit_rate: Option<f64>,
    packets_lost: Option<i64>,
    packets_dropped: Option<i64>,
    packets_retransmitted: Option<i64>,
}

fn non_negative(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

fn count(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

impl WireStats {
    fn into_record(self, observed_at_ms: u64) -> MetricsRecord {
        let session_id = match self.sid {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        MetricsRecord {
            session_id,
            rtt_ms: non_negative(self.link.rtt),
            bandwidth_mbps: non_negative(self.link.bandwidth),
            send_mbps: non_negative(self.send.mbit_rate),
            recv_mbps: non_negative(self.recv.mbit_rate),
            send_packets_lost: count(self.send.packets_lost),
            recv_packets_lost: count(self.recv.packets_lost),
            send_packets_dropped: count(self.send.packets_dropped),
            recv_packets_dropped: count(self.recv.packets_dropped),
            send_packets_retransmitted: count(self.send.packets_retransmitted),
            flow_window: count(self.window.flow),
            flight_window: count(self.window.flight),
            observed_at_ms,
        }
    }
}

/// Decode one line of transport output.
///
/// Only JSON objects are considered for metrics; a JSON array or scalar is
/// kept as a message, as is any object that does not fit the stats shape.
pub fn decode_line(bytes: &[u8], observed_at_ms: u64) -> Result<RawLine, DecodeError> {
    let text = String::from_utf8(bytes.to_vec())?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Blank);
    }
    if trimmed.starts_with('{') {
        if let Ok(wire) = serde_json::from_str::<WireStats>(trimmed) {
            return Ok(RawLine::Metrics(wire.into_record(observed_at_ms)));
        }
    }
    Ok(RawLine::Message(trimmed.to_string()))
}

// =============================================================================
// Connection state and triggers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Which trigger strings a message contained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerHits {
    pub connected: bool,
    pub disconnected: bool,
    pub clock_fault: bool,
}

const CONNECTED: usize = 0;
const DISCONNECTED: usize = 1;
const CLOCK_FAULT: usize = 2;

/// Case-sensitive substring matcher for the three trigger strings.
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    automaton: AhoCorasick,
}

impl TriggerMatcher {
    pub fn new(connected: &str, disconnected: &str, clock_fault: &str) -> Result<Self, ConfigError> {
        let automaton = AhoCorasick::new([connected, disconnected, clock_fault])
            .map_err(|err| ConfigError::Invalid(format!("trigger patterns: {err}")))?;
        Ok(Self { automaton })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, ConfigError> {
        Self::new(
            &config.connected_pattern,
            &config.disconnected_pattern,
            &config.clock_fault_pattern,
        )
    }

    pub fn scan(&self, message: &str) -> TriggerHits {
        let mut hits = TriggerHits::default();
        for found in self.automaton.find_overlapping_iter(message) {
            match found.pattern().as_usize() {
                CONNECTED => hits.connected = true,
                DISCONNECTED => hits.disconnected = true,
                CLOCK_FAULT => hits.clock_fault = true,
                _ => {}
            }
        }
        hits
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Everything the control loops may know about the transport, from one tick.
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    pub metrics: Option<MetricsRecord>,
    pub message: Option<String>,
    pub connection: ConnectionState,
    /// When the last metrics record arrived (collector start until then).
    pub last_update: Instant,
    pub last_update_ms: u64,
    /// Lines dropped because they could not be decoded.
    pub decode_errors: u64,
    /// Clock-fault restarts performed.
    pub restarts: u32,
}

impl TelemetrySnapshot {
    pub fn new(now: Instant) -> Self {
        Self {
            metrics: None,
            message: None,
            connection: ConnectionState::Disconnected,
            last_update: now,
            last_update_ms: epoch_ms(),
            decode_errors: 0,
            restarts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Time since the last metrics record.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
    }
}

/// Read side of the collector's snapshot channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    rx: watch::Receiver<Arc<TelemetrySnapshot>>,
}

impl TelemetryReader {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next published snapshot.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Result of ingesting one batch of lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub metrics: usize,
    pub messages: usize,
    pub decode_errors: usize,
    /// A clock-fault message was seen; the transport needs one restart.
    pub restart_required: bool,
}

/// Runs the transport and maintains the published [`TelemetrySnapshot`].
pub struct TelemetryCollector {
    supervisor: ProcessSupervisor,
    matcher: TriggerMatcher,
    restart_delay: Duration,
    state: TelemetrySnapshot,
    publisher: watch::Sender<Arc<TelemetrySnapshot>>,
}

impl TelemetryCollector {
    pub fn new(supervisor: ProcessSupervisor, config: &TransportConfig) -> Result<Self, ConfigError> {
        let state = TelemetrySnapshot::new(Instant::now());
        let (publisher, _) = watch::channel(Arc::new(state.clone()));
        Ok(Self {
            supervisor,
            matcher: TriggerMatcher::from_config(config)?,
            restart_delay: config.restart_delay(),
            state,
            publisher,
        })
    }

    pub fn start(&mut self) -> Result<(), crate::error::SpawnError> {
        self.supervisor.start()
    }

    pub fn reader(&self) -> TelemetryReader {
        TelemetryReader {
            rx: self.publisher.subscribe(),
        }
    }

    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.publisher.borrow())
    }

    /// Apply one tick's worth of output lines and publish the result.
    ///
    /// Metrics are applied first (the last one wins and implies Connected),
    /// then each message in arrival order. Does not restart anything; see
    /// [`IngestOutcome::restart_required`].
    pub fn ingest(&mut self, lines: Vec<Vec<u8>>, now: Instant) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        if lines.is_empty() {
            return outcome;
        }

        let observed_at_ms = epoch_ms();
        let mut latest_metrics = None;
        let mut messages = Vec::new();
        for line in &lines {
            match decode_line(line, observed_at_ms) {
                Ok(RawLine::Metrics(record)) => {
                    outcome.metrics += 1;
                    latest_metrics = Some(record);
                }
                Ok(RawLine::Message(text)) => {
                    outcome.messages += 1;
                    messages.push(text);
                }
                Err(err) => {
                    outcome.decode_errors += 1;
                    debug!(unit = %self.supervisor.unit(), error = %err, "dropped undecodable line");
                }
            }
        }

        self.state.decode_errors += outcome.decode_errors as u64;

        if let Some(record) = latest_metrics {
            debug!(
                unit = %self.supervisor.unit(),
                rtt_ms = ?record.rtt_ms,
                send_mbps = ?record.send_mbps,
                recv_mbps = ?record.recv_mbps,
                "metrics"
            );
            self.state.metrics = Some(record);
            self.state.last_update = now;
            self.state.last_update_ms = observed_at_ms;
            if self.state.connection != ConnectionState::Connected {
                info!(unit = %self.supervisor.unit(), "metrics arriving; marking source connected");
                self.state.connection = ConnectionState::Connected;
            }
        }

        for message in messages {
            info!(unit = %self.supervisor.unit(), message = %message, "transport output");
            let hits = self.matcher.scan(&message);
            if hits.connected && self.state.connection == ConnectionState::Disconnected {
                info!(unit = %self.supervisor.unit(), "source connected");
                self.state.connection = ConnectionState::Connected;
            }
            if hits.disconnected && self.state.connection == ConnectionState::Connected {
                warn!(unit = %self.supervisor.unit(), "source disconnected");
                self.state.connection = ConnectionState::Disconnected;
            }
            outcome.restart_required |= hits.clock_fault;
            self.state.message = Some(message);
        }

        self.publish();
        outcome
    }

    fn publish(&self) {
        self.publisher.send_replace(Arc::new(self.state.clone()));
    }
}

#[async_trait]
impl Supervised for TelemetryCollector {
    fn supervisor(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    async fn on_tick(&mut self) -> Result<(), SupervisorError> {
        let lines = self.supervisor.read_lines();
        let outcome = self.ingest(lines, Instant::now());
        if !outcome.restart_required {
            return Ok(());
        }

        error!(
            unit = %self.supervisor.unit(),
            pid = ?self.supervisor.pid(),
            process_started_at_ms = ?self.supervisor.started_at_ms(),
            last_update_ms = self.state.last_update_ms,
            "transport reported a clock fault; restarting"
        );
        self.supervisor
            .restart(self.restart_delay)
            .await
            .map_err(|source| SupervisorError::RestartFailed {
                unit: self.supervisor.unit().to_string(),
                source,
            })?;
        self.state.restarts = self.state.restarts.saturating_add(1);
        self.publish();
        info!(
            unit = %self.supervisor.unit(),
            pid = ?self.supervisor.pid(),
            restarts = self.state.restarts,
            "transport restarted after clock fault"
        );
        Ok(())
    }
}
