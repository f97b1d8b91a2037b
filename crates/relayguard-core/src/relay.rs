//! Wiring: transport, optional companion, and the two control loops.
//!
//! ```text
//! companion ──► transport ──► TelemetryCollector ──► watch<TelemetrySnapshot>
//!                                                        │
//!                              ┌─────────────────────────┴───────┐
//!                              ▼                                 ▼
//!                   HealthEvaluator + failover        HealthEvaluator + bitrate
//!                              │                                 │
//!                            Mixer                            Encoder
//! ```
//!
//! Each control loop gets its own evaluator, so the two can run with
//! different thresholds against the same telemetry.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bitrate::BitrateBinding;
use crate::collaborator::{Encoder, Mixer};
use crate::companion::CompanionProcess;
use crate::config::{Passphrase, RelayConfig};
use crate::control_loop::{ControlLoop, ControlLoopHandle, spawn_control_loop};
use crate::error::{Error, SupervisorError};
use crate::failover::FailoverBinding;
use crate::health::HealthEvaluator;
use crate::lock::{LockStore, SharedLockFlag};
use crate::supervisor::{ProcessSupervisor, SupervisorHandle, spawn_supervised};
use crate::telemetry::{TelemetryCollector, TelemetryReader};

pub const TRANSPORT_UNIT: &str = "transport";

/// Entry point for starting a relay.
pub struct Relay;

impl Relay {
    /// Launch every configured unit.
    ///
    /// A control loop runs only when its section is enabled and its
    /// collaborator was supplied. If the transport fails to launch, units
    /// already started are stopped before the error is returned.
    pub async fn start(
        config: &RelayConfig,
        passphrase: &Passphrase,
        mixer: Option<Arc<dyn Mixer>>,
        encoder: Option<Arc<dyn Encoder>>,
        locks: Arc<dyn LockStore>,
    ) -> crate::Result<RelayHandle> {
        let companion = if config.companion.enabled {
            let mut process = CompanionProcess::from_config(&config.companion);
            process.start()?;
            Some(spawn_supervised(process, config.companion.poll_interval()))
        } else {
            None
        };

        let transport = match Self::start_transport(config, passphrase) {
            Ok(collector) => collector,
            Err(err) => {
                if let Some(companion) = companion {
                    if let Err(stop_err) = companion.stop().await {
                        warn!(error = %stop_err, "companion stop failed during startup rollback");
                    }
                }
                return Err(err);
            }
        };
        let telemetry = transport.reader();
        let transport = spawn_supervised(transport, config.transport.poll_interval());

        let failover = match (config.failover.enabled, mixer) {
            (true, Some(mixer)) => {
                let binding = FailoverBinding::new(mixer, &config.failover);
                let lock = SharedLockFlag::new(Arc::clone(&locks), &config.failover.lock_key);
                let control = ControlLoop::new(binding.clone(), config.failover.timing, lock);
                let evaluator = HealthEvaluator::new(config.failover_health());
                Some(Controlled {
                    binding,
                    handle: spawn_control_loop(control, evaluator, telemetry.clone()),
                })
            }
            (true, None) => {
                warn!("failover enabled but no mixer configured; scene failover disabled");
                None
            }
            (false, _) => None,
        };

        let bitrate = match (config.bitrate.enabled, encoder) {
            (true, Some(encoder)) => {
                let binding = BitrateBinding::new(encoder);
                let lock = SharedLockFlag::new(Arc::clone(&locks), &config.bitrate.lock_key);
                let control = ControlLoop::new(binding.clone(), config.bitrate.timing, lock);
                let evaluator = HealthEvaluator::new(config.bitrate_health());
                Some(Controlled {
                    binding,
                    handle: spawn_control_loop(control, evaluator, telemetry.clone()),
                })
            }
            (true, None) => {
                warn!("bitrate control enabled but no encoder configured; bitrate backoff disabled");
                None
            }
            (false, _) => None,
        };

        info!(
            companion = companion.is_some(),
            failover = failover.is_some(),
            bitrate = bitrate.is_some(),
            passphrase_generated = passphrase.was_generated(),
            "relay started"
        );

        Ok(RelayHandle {
            transport,
            companion,
            failover,
            bitrate,
            telemetry,
        })
    }

    fn start_transport(config: &RelayConfig, passphrase: &Passphrase) -> crate::Result<TelemetryCollector> {
        let supervisor =
            ProcessSupervisor::new(TRANSPORT_UNIT, config.transport.command(passphrase));
        let mut collector = TelemetryCollector::new(supervisor, &config.transport)?;
        collector.start()?;
        Ok(collector)
    }
}

/// A running control loop plus a clone of its binding, shared with the
/// loop, for operator overrides.
struct Controlled<B> {
    binding: B,
    handle: ControlLoopHandle,
}

/// Running relay. Dropping it without [`RelayHandle::shutdown`] leaves the
/// background tasks running until the runtime exits.
pub struct RelayHandle {
    transport: SupervisorHandle,
    companion: Option<SupervisorHandle>,
    failover: Option<Controlled<FailoverBinding>>,
    bitrate: Option<Controlled<BitrateBinding>>,
    telemetry: TelemetryReader,
}

impl RelayHandle {
    pub fn telemetry(&self) -> &TelemetryReader {
        &self.telemetry
    }

    pub fn failover(&self) -> Option<&ControlLoopHandle> {
        self.failover.as_ref().map(|c| &c.handle)
    }

    pub fn bitrate(&self) -> Option<&ControlLoopHandle> {
        self.bitrate.as_ref().map(|c| &c.handle)
    }

    fn failover_control(&self) -> crate::Result<&Controlled<FailoverBinding>> {
        self.failover
            .as_ref()
            .ok_or(Error::ControlNotRunning { control: "failover" })
    }

    fn bitrate_control(&self) -> crate::Result<&Controlled<BitrateBinding>> {
        self.bitrate
            .as_ref()
            .ok_or(Error::ControlNotRunning { control: "bitrate" })
    }

    /// Show the standby scene and lock failover until [`Self::go_live`].
    pub async fn go_standby(&self) -> crate::Result<()> {
        let control = self.failover_control()?;
        control.binding.go_standby(control.handle.lock_flag()).await?;
        Ok(())
    }

    /// Back to the live scene; failover resumes automatic control.
    pub async fn go_live(&self) -> crate::Result<()> {
        let control = self.failover_control()?;
        control.binding.go_live(control.handle.lock_flag()).await?;
        Ok(())
    }

    /// Currently applied encoder bitrate, when bitrate control runs.
    pub fn current_bitrate(&self) -> Option<u32> {
        self.bitrate.as_ref().map(|c| c.binding.current_bitrate())
    }

    /// One rung down; locks bitrate control.
    pub async fn bitrate_step_down(&self) -> crate::Result<()> {
        let control = self.bitrate_control()?;
        control.binding.step_down(control.handle.lock_flag()).await?;
        Ok(())
    }

    /// One rung up; locks bitrate control.
    pub async fn bitrate_step_up(&self) -> crate::Result<()> {
        let control = self.bitrate_control()?;
        control.binding.step_up(control.handle.lock_flag()).await?;
        Ok(())
    }

    /// Jump to a ladder rung; locks bitrate control.
    pub async fn set_bitrate(&self, bitrate: u32) -> crate::Result<()> {
        let control = self.bitrate_control()?;
        control.binding.set_bitrate(control.handle.lock_flag(), bitrate).await?;
        Ok(())
    }

    /// Preferred bitrate again; bitrate control resumes.
    pub async fn reset_bitrate(&self) -> crate::Result<()> {
        let control = self.bitrate_control()?;
        control.binding.reset(control.handle.lock_flag()).await?;
        Ok(())
    }

    pub fn has_companion(&self) -> bool {
        self.companion.is_some()
    }

    /// Resolves when the transport tick loop ends on its own, which only
    /// happens after a fatal supervisor error.
    pub async fn transport_exited(&self) {
        self.transport.exited().await;
    }

    /// Stop control loops first, then the transport, then the companion.
    /// Returns the transport's error if its loop had failed.
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        if let Some(failover) = self.failover {
            failover.handle.stop().await;
        }
        if let Some(bitrate) = self.bitrate {
            bitrate.handle.stop().await;
        }
        let transport = self.transport.stop().await;
        if let Some(companion) = self.companion {
            if let Err(err) = companion.stop().await {
                warn!(error = %err, "companion loop ended with error");
            }
        }
        info!("relay stopped");
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;

    #[tokio::test]
    async fn missing_transport_binary_is_a_spawn_error() {
        let mut config = RelayConfig::default();
        config.transport.program = "/nonexistent/relayguard-test-transport".to_string();
        let passphrase = config.transport.resolve_passphrase();
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());

        let result = Relay::start(&config, &passphrase, None, None, locks).await;
        match result {
            Err(Error::Spawn(err)) => assert_eq!(err.unit, TRANSPORT_UNIT),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("transport should not have started"),
        }
    }

    #[tokio::test]
    async fn missing_companion_binary_stops_before_transport() {
        let mut config = RelayConfig::default();
        config.companion.enabled = true;
        config.companion.program = "/nonexistent/relayguard-test-companion".to_string();
        let passphrase = config.transport.resolve_passphrase();
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());

        let result = Relay::start(&config, &passphrase, None, None, locks).await;
        assert!(matches!(result, Err(Error::Spawn(err)) if err.unit == crate::companion::UNIT));
    }
}
