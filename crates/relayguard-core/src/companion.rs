//! Bonding receiver that runs next to the transport.
//!
//! The companion merges bonded links into the single SRT stream the
//! transport listens for. Its output is only forwarded to the log.

use async_trait::async_trait;
use tracing::info;

use crate::config::CompanionConfig;
use crate::error::{SpawnError, SupervisorError};
use crate::supervisor::{ProcessSupervisor, Supervised};

pub const UNIT: &str = "companion";

pub struct CompanionProcess {
    supervisor: ProcessSupervisor,
    forwarded: u64,
}

impl CompanionProcess {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self {
            supervisor,
            forwarded: 0,
        }
    }

    pub fn from_config(config: &CompanionConfig) -> Self {
        Self::new(ProcessSupervisor::new(UNIT, config.command()))
    }

    pub fn start(&mut self) -> Result<(), SpawnError> {
        self.supervisor.start()
    }

    /// Lines forwarded to the log so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Log every pending non-blank output line. Returns how many were logged.
    pub fn forward_pending(&mut self) -> usize {
        let mut logged = 0;
        for line in self.supervisor.read_lines() {
            let text = String::from_utf8_lossy(&line);
            if text.trim().is_empty() {
                continue;
            }
            info!(unit = %self.supervisor.unit(), message = %text, "companion output");
            logged += 1;
        }
        self.forwarded += logged as u64;
        logged
    }
}

#[async_trait]
impl Supervised for CompanionProcess {
    fn supervisor(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    async fn on_tick(&mut self) -> Result<(), SupervisorError> {
        self.forward_pending();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_receiver_command() {
        let config = CompanionConfig {
            enabled: true,
            ..CompanionConfig::default()
        };
        let mut companion = CompanionProcess::from_config(&config);
        assert_eq!(companion.supervisor().unit(), UNIT);
        assert_eq!(companion.supervisor().command().program, "srtla_rec");
        assert!(!companion.supervisor().is_running());
    }

    #[test]
    fn nothing_forwarded_before_start() {
        let mut companion = CompanionProcess::from_config(&CompanionConfig::default());
        assert_eq!(companion.forward_pending(), 0);
        assert_eq!(companion.forwarded(), 0);
    }
}
