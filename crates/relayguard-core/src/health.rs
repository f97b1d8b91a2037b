//! Link health evaluation.
//!
//! Turns telemetry snapshots into a [`Verdict`], one per control-loop tick.
//! Checks run in this order, the first failing one deciding the reason:
//!
//! 1. disconnected: unhealthy
//! 2. stale metrics while connected: unhealthy, windows untouched
//! 3. windowed RTT mean above the ceiling (skipped when disabled)
//! 4. windowed throughput mean below the floor (skipped when disabled)

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::telemetry::{ConnectionState, TelemetrySnapshot};
use crate::window::SampleWindow;

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VerdictReason {
    Nominal,
    Disconnected,
    Stale { age_ms: u64, limit_ms: u64 },
    Degraded { rtt_exceeded: bool, throughput_below: bool },
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nominal => write!(f, "nominal"),
            Self::Disconnected => write!(f, "source disconnected"),
            Self::Stale { age_ms, limit_ms } => {
                write!(f, "no metrics for {age_ms} ms (limit {limit_ms} ms)")
            }
            Self::Degraded {
                rtt_exceeded,
                throughput_below,
            } => match (rtt_exceeded, throughput_below) {
                (true, true) => write!(f, "rtt too high and throughput too low"),
                (true, false) => write!(f, "rtt too high"),
                _ => write!(f, "throughput too low"),
            },
        }
    }
}

/// Health verdict for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub healthy: bool,
    pub reason: VerdictReason,
    /// RTT window mean after this tick, when the check is enabled.
    pub rtt_mean_ms: Option<f64>,
    /// Throughput window mean after this tick, when the check is enabled.
    pub throughput_mean_mbps: Option<f64>,
}

impl Verdict {
    fn unhealthy(reason: VerdictReason) -> Self {
        Self {
            healthy: false,
            reason,
            rtt_mean_ms: None,
            throughput_mean_mbps: None,
        }
    }
}

/// Sliding-window RTT and throughput checks.
#[derive(Debug, Clone)]
pub struct HealthEvaluator {
    rtt_max_ms: Option<f64>,
    throughput_min_mbps: Option<f64>,
    stale_after: Duration,
    rtt: SampleWindow,
    throughput: SampleWindow,
}

impl HealthEvaluator {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            rtt_max_ms: config.rtt_threshold(),
            throughput_min_mbps: config.throughput_threshold(),
            stale_after: config.stale_after(),
            rtt: SampleWindow::new(config.window_size),
            throughput: SampleWindow::new(config.window_size),
        }
    }

    pub fn rtt_window(&self) -> &SampleWindow {
        &self.rtt
    }

    pub fn throughput_window(&self) -> &SampleWindow {
        &self.throughput
    }

    /// Evaluate one snapshot. `previous` is only used to log transitions.
    pub fn evaluate(
        &mut self,
        snapshot: &TelemetrySnapshot,
        previous: Option<&Verdict>,
        now: Instant,
    ) -> Verdict {
        let verdict = self.judge(snapshot, now);
        match previous {
            Some(prev) if prev.healthy == verdict.healthy => {
                debug!(healthy = verdict.healthy, reason = %verdict.reason, "health evaluated");
            }
            _ if verdict.healthy => {
                info!(
                    rtt_ms = ?verdict.rtt_mean_ms,
                    throughput_mbps = ?verdict.throughput_mean_mbps,
                    "link healthy"
                );
            }
            _ => {
                warn!(
                    reason = %verdict.reason,
                    rtt_ms = ?verdict.rtt_mean_ms,
                    throughput_mbps = ?verdict.throughput_mean_mbps,
                    "link unhealthy"
                );
            }
        }
        verdict
    }

    fn judge(&mut self, snapshot: &TelemetrySnapshot, now: Instant) -> Verdict {
        if snapshot.connection == ConnectionState::Disconnected {
            return Verdict::unhealthy(VerdictReason::Disconnected);
        }

        let age = snapshot.age(now);
        if age > self.stale_after {
            return Verdict::unhealthy(VerdictReason::Stale {
                age_ms: age.as_millis() as u64,
                limit_ms: self.stale_after.as_millis() as u64,
            });
        }

        let metrics = snapshot.metrics.as_ref();

        let mut rtt_mean_ms = None;
        let mut rtt_exceeded = false;
        if let Some(limit) = self.rtt_max_ms {
            self.rtt.push(metrics.and_then(|m| m.rtt_ms));
            rtt_mean_ms = self.rtt.mean();
            rtt_exceeded = rtt_mean_ms.is_some_and(|mean| mean > limit);
        }

        let mut throughput_mean_mbps = None;
        let mut throughput_below = false;
        if let Some(floor) = self.throughput_min_mbps {
            self.throughput
                .push(metrics.and_then(crate::telemetry::MetricsRecord::throughput_mbps));
            throughput_mean_mbps = self.throughput.mean();
            throughput_below = throughput_mean_mbps.is_some_and(|mean| mean < floor);
        }

        let healthy = !rtt_exceeded && !throughput_below;
        Verdict {
            healthy,
            reason: if healthy {
                VerdictReason::Nominal
            } else {
                VerdictReason::Degraded {
                    rtt_exceeded,
                    throughput_below,
                }
            },
            rtt_mean_ms,
            throughput_mean_mbps,
        }
    }
}
