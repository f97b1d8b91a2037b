//! Hysteresis/cooldown control loop shared by failover and bitrate backoff.
//!
//! Each tick takes a health [`Verdict`] and the side currently applied by
//! the collaborator (queried, never assumed) and decides between:
//!
//! - **hold**: manual lock set, nothing changes
//! - **degrade**: unhealthy on a side that can go lower, gated by cooldown
//! - **stabilize**: healthy on a degraded side, count down before recovering
//! - **recover**: countdown expired, step back toward nominal
//!
//! An unhealthy tick on the floor resets any running countdown. Collaborator
//! failures are logged and never abort a tick.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collaborator::call_with_timeout;
use crate::config::LoopTiming;
use crate::error::CollaboratorError;
use crate::health::{HealthEvaluator, Verdict};
use crate::lock::SharedLockFlag;
use crate::telemetry::TelemetryReader;

/// Which side of the action the collaborator is on right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedSide {
    /// Live scene / preferred bitrate.
    Nominal,
    /// Somewhere between nominal and floor (bitrate ladder middle rungs).
    Partial,
    /// Standby scene / lowest bitrate.
    Floor,
}

impl AppliedSide {
    pub fn is_degraded(self) -> bool {
        !matches!(self, Self::Nominal)
    }

    pub fn can_degrade(self) -> bool {
        !matches!(self, Self::Floor)
    }
}

impl fmt::Display for AppliedSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nominal => write!(f, "nominal"),
            Self::Partial => write!(f, "partial"),
            Self::Floor => write!(f, "floor"),
        }
    }
}

/// The degrade/recover capability a loop drives.
#[async_trait]
pub trait ControlBinding: Send + Sync + 'static {
    /// Short name used in logs (`failover`, `bitrate`).
    fn name(&self) -> &'static str;

    async fn applied_side(&self) -> Result<AppliedSide, CollaboratorError>;

    /// Move one step toward the floor.
    async fn degrade(&self) -> Result<(), CollaboratorError>;

    /// Move one step toward nominal.
    async fn recover(&self) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Idle,
    Degraded,
    Stabilizing { remaining: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopModeKind {
    Idle,
    Degraded,
    Stabilizing,
}

impl From<LoopMode> for LoopModeKind {
    fn from(mode: LoopMode) -> Self {
        match mode {
            LoopMode::Idle => Self::Idle,
            LoopMode::Degraded => Self::Degraded,
            LoopMode::Stabilizing { .. } => Self::Stabilizing,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Manual lock set; state frozen.
    Locked,
    /// Healthy on the nominal side.
    Steady,
    /// Stabilization countdown running.
    Counting { remaining: Duration },
    Recovered,
    Degraded,
    /// Unhealthy but still inside the cooldown window.
    Suppressed { cooldown_remaining: Duration },
    /// Unhealthy on the floor; countdown reset.
    HeldAtFloor,
    ActionFailed { operation: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopCounters {
    pub ticks: u64,
    pub degrades: u64,
    pub recoveries: u64,
    pub suppressed: u64,
    pub failed_calls: u64,
}

/// Point-in-time view of a loop, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub name: &'static str,
    pub mode: LoopModeKind,
    pub countdown_remaining_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub locked: bool,
    pub last_side: AppliedSide,
    pub counters: LoopCounters,
}

/// Timer-driven decision engine over one [`ControlBinding`].
pub struct ControlLoop<B: ControlBinding> {
    binding: B,
    timing: LoopTiming,
    lock: SharedLockFlag,
    mode: LoopMode,
    cooldown_until: Option<Instant>,
    locked: bool,
    last_side: AppliedSide,
    counters: LoopCounters,
    status: watch::Sender<LoopStatus>,
}

impl<B: ControlBinding> ControlLoop<B> {
    pub fn new(binding: B, timing: LoopTiming, lock: SharedLockFlag) -> Self {
        let name = binding.name();
        let (status, _) = watch::channel(LoopStatus {
            name,
            mode: LoopModeKind::Idle,
            countdown_remaining_ms: None,
            cooldown_remaining_ms: None,
            locked: false,
            last_side: AppliedSide::Nominal,
            counters: LoopCounters::default(),
        });
        Self {
            binding,
            timing,
            lock,
            mode: LoopMode::Idle,
            cooldown_until: None,
            locked: false,
            last_side: AppliedSide::Nominal,
            counters: LoopCounters::default(),
            status,
        }
    }

    pub fn name(&self) -> &'static str {
        self.binding.name()
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    pub fn counters(&self) -> LoopCounters {
        self.counters
    }

    pub fn lock_flag(&self) -> &SharedLockFlag {
        &self.lock
    }

    /// Set the manual lock. Takes effect on the next tick; no action fires.
    pub fn lock(&self) {
        self.lock.lock();
    }

    /// Clear the manual lock. The next tick acts on current health.
    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    pub fn status(&self, now: Instant) -> LoopStatus {
        LoopStatus {
            name: self.binding.name(),
            mode: self.mode.into(),
            countdown_remaining_ms: match self.mode {
                LoopMode::Stabilizing { remaining } => Some(remaining.as_millis() as u64),
                _ => None,
            },
            cooldown_remaining_ms: self
                .cooldown_until
                .map(|until| until.saturating_duration_since(now))
                .filter(|d| !d.is_zero())
                .map(|d| d.as_millis() as u64),
            locked: self.locked,
            last_side: self.last_side,
            counters: self.counters,
        }
    }

    /// Run one decision step at time `now`.
    pub async fn tick(&mut self, verdict: &Verdict, now: Instant) -> TickAction {
        self.counters.ticks += 1;

        let locked = self.lock.get();
        if locked != self.locked {
            info!(
                control = self.binding.name(),
                key = self.lock.key(),
                locked,
                "manual lock changed"
            );
            self.locked = locked;
        }

        let action = if locked {
            debug!(control = self.binding.name(), "locked; holding");
            TickAction::Locked
        } else {
            let side = self.read_side().await;
            if verdict.healthy {
                self.on_healthy(side).await
            } else {
                self.on_unhealthy(side, verdict, now).await
            }
        };

        self.status.send_replace(self.status(now));
        action
    }

    async fn read_side(&mut self) -> AppliedSide {
        let call = self.binding.applied_side();
        match call_with_timeout("applied_side", self.timing.call_timeout(), call).await {
            Ok(side) => {
                self.last_side = side;
                side
            }
            Err(err) => {
                self.counters.failed_calls += 1;
                warn!(
                    control = self.binding.name(),
                    error = %err,
                    fallback = %self.last_side,
                    "could not read applied side; using last known"
                );
                self.last_side
            }
        }
    }

    async fn on_healthy(&mut self, side: AppliedSide) -> TickAction {
        let name = self.binding.name();
        if !side.is_degraded() {
            if self.mode != LoopMode::Idle {
                info!(control = name, "link healthy on nominal side; idle");
            }
            self.mode = LoopMode::Idle;
            return TickAction::Steady;
        }

        let remaining = if let LoopMode::Stabilizing { remaining } = self.mode {
            remaining
        } else {
            info!(
                control = name,
                side = %side,
                stabilize_ms = self.timing.stabilize_ms,
                "link healthy again; stabilization started"
            );
            self.timing.stabilize()
        };
        let remaining = remaining.saturating_sub(self.timing.tick_interval());
        if !remaining.is_zero() {
            self.mode = LoopMode::Stabilizing { remaining };
            return TickAction::Counting { remaining };
        }

        let call = self.binding.recover();
        match call_with_timeout("recover", self.timing.call_timeout(), call).await {
            Ok(()) => {
                self.counters.recoveries += 1;
                self.mode = LoopMode::Idle;
                info!(control = name, from = %side, "stabilization complete; recovered");
                TickAction::Recovered
            }
            Err(err) => {
                self.counters.failed_calls += 1;
                // Countdown stays expired so the next healthy tick retries.
                self.mode = LoopMode::Stabilizing {
                    remaining: Duration::ZERO,
                };
                warn!(control = name, error = %err, "recovery action failed");
                TickAction::ActionFailed {
                    operation: err.operation(),
                }
            }
        }
    }

    async fn on_unhealthy(
        &mut self,
        side: AppliedSide,
        verdict: &Verdict,
        now: Instant,
    ) -> TickAction {
        let name = self.binding.name();
        if let LoopMode::Stabilizing { remaining } = self.mode {
            info!(
                control = name,
                reason = %verdict.reason,
                remaining_ms = remaining.as_millis() as u64,
                "relapse during stabilization; countdown reset"
            );
            self.mode = LoopMode::Degraded;
        }

        if !side.can_degrade() {
            self.mode = LoopMode::Degraded;
            debug!(control = name, reason = %verdict.reason, "unhealthy at floor; holding");
            return TickAction::HeldAtFloor;
        }

        if let Some(until) = self.cooldown_until {
            if now < until {
                let cooldown_remaining = until - now;
                self.counters.suppressed += 1;
                info!(
                    control = name,
                    reason = %verdict.reason,
                    side = %side,
                    cooldown_remaining_ms = cooldown_remaining.as_millis() as u64,
                    "degrade suppressed by cooldown"
                );
                return TickAction::Suppressed { cooldown_remaining };
            }
        }

        let call = self.binding.degrade();
        let result = call_with_timeout("degrade", self.timing.call_timeout(), call).await;
        self.mode = LoopMode::Degraded;
        match result {
            Ok(()) => {
                self.counters.degrades += 1;
                self.cooldown_until = Some(now + self.timing.cooldown());
                warn!(
                    control = name,
                    reason = %verdict.reason,
                    from = %side,
                    rtt_ms = ?verdict.rtt_mean_ms,
                    throughput_mbps = ?verdict.throughput_mean_mbps,
                    cooldown_ms = self.timing.cooldown_ms,
                    "link unhealthy; degraded"
                );
                TickAction::Degraded
            }
            Err(err) => {
                self.counters.failed_calls += 1;
                warn!(
                    control = name,
                    reason = %verdict.reason,
                    error = %err,
                    "degrade action failed; retrying next tick"
                );
                TickAction::ActionFailed {
                    operation: err.operation(),
                }
            }
        }
    }
}

// =============================================================================
// Background driver
// =============================================================================

/// Handle to a spawned control loop.
pub struct ControlLoopHandle {
    name: &'static str,
    lock: SharedLockFlag,
    status: watch::Receiver<LoopStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlLoopHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.lock.get()
    }

    pub fn lock_flag(&self) -> &SharedLockFlag {
        &self.lock
    }

    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(control = self.name, error = %err, "control loop task failed");
        }
    }

    pub async fn stop(self) {
        self.signal_shutdown();
        self.join().await;
    }
}

/// Evaluate health and tick `control` every tick interval until stopped.
#[must_use]
pub fn spawn_control_loop<B: ControlBinding>(
    mut control: ControlLoop<B>,
    mut evaluator: HealthEvaluator,
    telemetry: TelemetryReader,
) -> ControlLoopHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let name = control.name();
    let lock = control.lock_flag().clone();
    let status = control.subscribe();
    let tick_interval = control.timing.tick_interval();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<Verdict> = None;
        info!(
            control = name,
            tick_ms = tick_interval.as_millis() as u64,
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = telemetry.snapshot();
                    let now = Instant::now();
                    let verdict = evaluator.evaluate(&snapshot, previous.as_ref(), now);
                    control.tick(&verdict, now).await;
                    previous = Some(verdict);
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        info!(control = name, "control loop stopped");
    });

    ControlLoopHandle {
        name,
        lock,
        status,
        shutdown: shutdown_tx,
        task,
    }
}
