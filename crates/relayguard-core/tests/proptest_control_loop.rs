//! Property-based tests for the control loop state machine.
//!
//! Verifies:
//! - A locked loop never calls degrade or recover
//! - Degrades are never closer together than the cooldown
//! - Recovery fires after exactly ceil(stabilize / tick) healthy ticks
//! - A relapse restarts the stabilization countdown from scratch
//! - The bitrate ladder index never leaves the ladder
//!
//! Time is driven explicitly through the `now` argument to `tick`, so
//! these properties do not depend on wall-clock timing.

use proptest::prelude::*;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relayguard_core::bitrate::BitrateBinding;
use relayguard_core::collaborator::{Encoder, RecordingEncoder};
use relayguard_core::config::LoopTiming;
use relayguard_core::control_loop::{AppliedSide, ControlBinding, ControlLoop, TickAction};
use relayguard_core::error::CollaboratorError;
use relayguard_core::health::{Verdict, VerdictReason};
use relayguard_core::lock::SharedLockFlag;

// ────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────

/// Binding whose side only changes when the test says so.
#[derive(Clone)]
struct PinnedBinding {
    side: Arc<Mutex<AppliedSide>>,
    degrades: Arc<AtomicUsize>,
    recovers: Arc<AtomicUsize>,
}

impl PinnedBinding {
    fn new(side: AppliedSide) -> Self {
        Self {
            side: Arc::new(Mutex::new(side)),
            degrades: Arc::new(AtomicUsize::new(0)),
            recovers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn degrades(&self) -> usize {
        self.degrades.load(Ordering::SeqCst)
    }

    fn recovers(&self) -> usize {
        self.recovers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlBinding for PinnedBinding {
    fn name(&self) -> &'static str {
        "pinned"
    }

    async fn applied_side(&self) -> Result<AppliedSide, CollaboratorError> {
        Ok(*self.side.lock().unwrap())
    }

    async fn degrade(&self) -> Result<(), CollaboratorError> {
        self.degrades.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self) -> Result<(), CollaboratorError> {
        self.recovers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn verdict(healthy: bool) -> Verdict {
    Verdict {
        healthy,
        reason: if healthy {
            VerdictReason::Nominal
        } else {
            VerdictReason::Disconnected
        },
        rtt_mean_ms: None,
        throughput_mean_mbps: None,
    }
}

fn timing(tick_ms: u64, stabilize_ms: u64, cooldown_ms: u64) -> LoopTiming {
    LoopTiming {
        tick_interval_ms: tick_ms,
        stabilize_ms,
        cooldown_ms,
        call_timeout_ms: 1000,
    }
}

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_side() -> impl Strategy<Value = AppliedSide> {
    prop_oneof![
        Just(AppliedSide::Nominal),
        Just(AppliedSide::Partial),
        Just(AppliedSide::Floor),
    ]
}

fn arb_timing() -> impl Strategy<Value = LoopTiming> {
    (100u64..=2000, 1u64..=20_000, 0u64..=60_000)
        .prop_map(|(tick, stabilize, cooldown)| timing(tick, stabilize, cooldown))
}

fn arb_ladder() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::btree_set(100_000u32..20_000_000, 1..8)
        .prop_map(|rungs| rungs.into_iter().rev().collect())
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Degrade,
    Recover,
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(prop_oneof![Just(Step::Degrade), Just(Step::Recover)], 0..40)
}

// ────────────────────────────────────────────────────────────────────
// Manual lock
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// While locked, no action is taken whatever the health sequence.
    #[test]
    fn prop_locked_never_acts(
        side in arb_side(),
        timing in arb_timing(),
        health in prop::collection::vec(any::<bool>(), 1..50),
    ) {
        let rt = runtime();
        let binding = PinnedBinding::new(side);
        let lock = SharedLockFlag::in_memory("scene_lock");
        lock.lock();
        let mut control = ControlLoop::new(binding.clone(), timing, lock);
        let start = Instant::now();

        for (i, healthy) in health.iter().enumerate() {
            let now = start + timing.tick_interval() * i as u32;
            let action = rt.block_on(control.tick(&verdict(*healthy), now));
            prop_assert_eq!(action, TickAction::Locked);
        }
        prop_assert_eq!(binding.degrades(), 0);
        prop_assert_eq!(binding.recovers(), 0);
    }
}

// ────────────────────────────────────────────────────────────────────
// Cooldown
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Under continuous ill health, degrades happen exactly when the
    /// cooldown since the previous one has elapsed.
    #[test]
    fn prop_degrades_respect_cooldown(
        timing in arb_timing(),
        ticks in 1usize..80,
    ) {
        let rt = runtime();
        let binding = PinnedBinding::new(AppliedSide::Nominal);
        let mut control =
            ControlLoop::new(binding.clone(), timing, SharedLockFlag::in_memory("scene_lock"));
        let start = Instant::now();

        let mut expected = 0usize;
        let mut next_allowed: Option<Duration> = None;
        for i in 0..ticks {
            let offset = timing.tick_interval() * i as u32;
            let action = rt.block_on(control.tick(&verdict(false), start + offset));
            if next_allowed.is_none_or(|until| offset >= until) {
                prop_assert_eq!(action, TickAction::Degraded);
                expected += 1;
                next_allowed = Some(offset + timing.cooldown());
            } else {
                let is_suppressed = matches!(action, TickAction::Suppressed { .. });
                prop_assert!(is_suppressed);
            }
        }
        prop_assert_eq!(binding.degrades(), expected);
    }

    /// Unhealthy at the floor never degrades.
    #[test]
    fn prop_floor_never_degrades(
        timing in arb_timing(),
        ticks in 1usize..40,
    ) {
        let rt = runtime();
        let binding = PinnedBinding::new(AppliedSide::Floor);
        let mut control =
            ControlLoop::new(binding.clone(), timing, SharedLockFlag::in_memory("scene_lock"));
        let start = Instant::now();
        for i in 0..ticks {
            let now = start + timing.tick_interval() * i as u32;
            let action = rt.block_on(control.tick(&verdict(false), now));
            prop_assert_eq!(action, TickAction::HeldAtFloor);
        }
        prop_assert_eq!(binding.degrades(), 0);
    }
}

// ────────────────────────────────────────────────────────────────────
// Stabilization
// ────────────────────────────────────────────────────────────────────

fn ticks_to_recover(timing: &LoopTiming) -> usize {
    timing
        .stabilize_ms
        .div_ceil(timing.tick_interval_ms)
        .max(1) as usize
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// From a degraded side, recovery fires on the first tick where the
    /// accumulated healthy time reaches the stabilize period.
    #[test]
    fn prop_recovery_after_stabilize(
        side in prop_oneof![Just(AppliedSide::Partial), Just(AppliedSide::Floor)],
        timing in arb_timing(),
    ) {
        let rt = runtime();
        let binding = PinnedBinding::new(side);
        let mut control =
            ControlLoop::new(binding.clone(), timing, SharedLockFlag::in_memory("scene_lock"));
        let start = Instant::now();
        let needed = ticks_to_recover(&timing);

        for i in 0..needed {
            let now = start + timing.tick_interval() * i as u32;
            let action = rt.block_on(control.tick(&verdict(true), now));
            if i + 1 < needed {
                let is_counting = matches!(action, TickAction::Counting { .. });
                prop_assert!(is_counting);
                prop_assert_eq!(binding.recovers(), 0);
            } else {
                prop_assert_eq!(action, TickAction::Recovered);
            }
        }
        prop_assert_eq!(binding.recovers(), 1);
    }

    /// A single unhealthy tick during stabilization restarts the countdown.
    #[test]
    fn prop_relapse_resets_countdown(
        timing in arb_timing(),
        healthy_before in 0usize..20,
    ) {
        let needed = ticks_to_recover(&timing);
        prop_assume!(healthy_before < needed);

        let rt = runtime();
        let binding = PinnedBinding::new(AppliedSide::Floor);
        let mut control =
            ControlLoop::new(binding.clone(), timing, SharedLockFlag::in_memory("scene_lock"));
        let start = Instant::now();
        let mut i = 0u32;
        let mut next = || {
            let now = start + timing.tick_interval() * i;
            i += 1;
            now
        };

        for _ in 0..healthy_before {
            rt.block_on(control.tick(&verdict(true), next()));
        }
        let action = rt.block_on(control.tick(&verdict(false), next()));
        prop_assert_eq!(action, TickAction::HeldAtFloor);

        for _ in 0..needed - 1 {
            let action = rt.block_on(control.tick(&verdict(true), next()));
            let is_counting = matches!(action, TickAction::Counting { .. });
            prop_assert!(is_counting);
        }
        let action = rt.block_on(control.tick(&verdict(true), next()));
        prop_assert_eq!(action, TickAction::Recovered);
        prop_assert_eq!(binding.recovers(), 1);
        prop_assert_eq!(binding.degrades(), 0);
    }
}

// ────────────────────────────────────────────────────────────────────
// Bitrate ladder
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any sequence of degrade/recover keeps the index on the ladder and
    /// only ever sends ladder rungs to the encoder.
    #[test]
    fn prop_ladder_index_stays_in_bounds(
        ladder in arb_ladder(),
        steps in arb_steps(),
    ) {
        let rt = runtime();
        let encoder = Arc::new(RecordingEncoder::new(ladder.clone()));
        let binding = BitrateBinding::new(Arc::clone(&encoder) as Arc<dyn Encoder>);

        let mut expected = 0usize;
        for step in steps {
            match step {
                Step::Degrade => {
                    rt.block_on(binding.degrade()).unwrap();
                    expected = (expected + 1).min(ladder.len() - 1);
                }
                Step::Recover => {
                    rt.block_on(binding.recover()).unwrap();
                    expected = expected.saturating_sub(1);
                }
            }
            prop_assert_eq!(binding.index(), expected);
            prop_assert_eq!(binding.current_bitrate(), ladder[expected]);
        }
        for rate in encoder.history() {
            prop_assert!(ladder.contains(&rate));
        }
    }

    /// Side classification follows the index.
    #[test]
    fn prop_ladder_side_matches_index(
        ladder in arb_ladder(),
        degrades in 0usize..10,
    ) {
        let rt = runtime();
        let encoder = Arc::new(RecordingEncoder::new(ladder.clone()));
        let binding = BitrateBinding::new(encoder as Arc<dyn Encoder>);
        for _ in 0..degrades {
            rt.block_on(binding.degrade()).unwrap();
        }
        let side = rt.block_on(binding.applied_side()).unwrap();
        let index = binding.index();
        let expected = if index == 0 {
            AppliedSide::Nominal
        } else if index == ladder.len() - 1 {
            AppliedSide::Floor
        } else {
            AppliedSide::Partial
        };
        prop_assert_eq!(side, expected);
    }
}
