//! Relay configuration (`relayguard.toml`).
//!
//! Every section is `#[serde(default)]`, so a partial file only overrides
//! what it names. Durations are stored as integer milliseconds and exposed
//! as [`Duration`] accessors.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};
use crate::supervisor::ProcessCommand;

/// Threshold value that turns an individual health check off.
pub const DISABLED_THRESHOLD: f64 = -1.0;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub logging: LogConfig,
    pub transport: TransportConfig,
    pub companion: CompanionConfig,
    pub health: HealthConfig,
    pub failover: FailoverConfig,
    pub bitrate: BitrateConfig,
    pub lock: LockConfig,
}

impl RelayConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Health thresholds for the failover loop (section override or `[health]`).
    pub fn failover_health(&self) -> &HealthConfig {
        self.failover.health.as_ref().unwrap_or(&self.health)
    }

    /// Health thresholds for the bitrate loop (section override or `[health]`).
    pub fn bitrate_health(&self) -> &HealthConfig {
        self.bitrate.health.as_ref().unwrap_or(&self.health)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.logging.level.contains('=') && !self.logging.level.contains(',') {
            self.logging
                .level
                .parse::<LogLevel>()
                .map_err(ConfigError::Invalid)?;
        }

        self.transport.validate()?;
        if self.companion.enabled {
            self.companion.validate()?;
        }
        self.health.validate("health")?;
        if self.failover.enabled {
            self.failover.validate()?;
            self.failover_health().validate("failover.health")?;
        }
        if self.bitrate.enabled {
            self.bitrate.validate()?;
            self.bitrate_health().validate("bitrate.health")?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn require_nonzero_ms(section: &str, key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(format!("{section}.{key} must be greater than zero")));
    }
    Ok(())
}

/// `[transport]`: the SRT listener process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub program: String,
    /// Listener URL, e.g. `srt://:4001`
    pub source: String,
    /// Output URL, e.g. `udp://127.0.0.1:4002`
    pub destination: String,
    /// Encryption passphrase. Empty means generate one at startup.
    pub passphrase: String,
    /// Packets between JSON stats lines (`-s`)
    pub stats_interval_packets: u32,
    pub latency_ms: u32,
    pub loss_max_ttl: u32,
    pub poll_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub connected_pattern: String,
    pub disconnected_pattern: String,
    pub clock_fault_pattern: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            program: "srt-live-transmit".to_string(),
            source: "srt://:4001".to_string(),
            destination: "udp://127.0.0.1:4002".to_string(),
            passphrase: String::new(),
            stats_interval_packets: 100,
            latency_ms: 2000,
            loss_max_ttl: 50,
            poll_interval_ms: 100,
            restart_delay_ms: 1000,
            connected_pattern: "Accepted SRT source connection".to_string(),
            disconnected_pattern: "SRT source disconnected".to_string(),
            clock_fault_pattern: "Wrong source time was provided".to_string(),
        }
    }
}

/// Transport passphrase, either from config or freshly generated.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase {
    value: String,
    generated: bool,
}

impl Passphrase {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// True when no passphrase was configured and this one was generated.
    pub fn was_generated(&self) -> bool {
        self.generated
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase")
            .field("value", &"****")
            .field("generated", &self.generated)
            .finish()
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_passphrase() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn resolve_passphrase(&self) -> Passphrase {
        if self.passphrase.is_empty() {
            Passphrase {
                value: generate_passphrase(),
                generated: true,
            }
        } else {
            Passphrase {
                value: self.passphrase.clone(),
                generated: false,
            }
        }
    }

    /// Build the `srt-live-transmit` invocation. The passphrase is masked
    /// when the command is displayed.
    pub fn command(&self, passphrase: &Passphrase) -> ProcessCommand {
        let separator = if self.source.contains('?') { '&' } else { '?' };
        let source = format!(
            "{}{separator}passphrase={}&enforcedencryption=true&mode=listener&lossmaxttl={}&latency={}",
            self.source,
            passphrase.as_str(),
            self.loss_max_ttl,
            self.latency_ms,
        );
        ProcessCommand::new(&self.program)
            .arg("-srctime")
            .arg("-buffering")
            .arg("1")
            .arg("-s")
            .arg(self.stats_interval_packets.to_string())
            .arg("-pf")
            .arg("json")
            .arg(source)
            .arg(&self.destination)
            .with_secret(passphrase.as_str())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(invalid("transport.program must not be empty"));
        }
        if self.source.trim().is_empty() || self.destination.trim().is_empty() {
            return Err(invalid("transport.source and transport.destination are required"));
        }
        if !self.passphrase.is_empty() && !(10..=79).contains(&self.passphrase.len()) {
            return Err(invalid("transport.passphrase must be 10 to 79 characters"));
        }
        require_nonzero_ms("transport", "poll_interval_ms", self.poll_interval_ms)?;
        if self.stats_interval_packets == 0 {
            return Err(invalid("transport.stats_interval_packets must be greater than zero"));
        }
        for (key, pattern) in [
            ("connected_pattern", &self.connected_pattern),
            ("disconnected_pattern", &self.disconnected_pattern),
            ("clock_fault_pattern", &self.clock_fault_pattern),
        ] {
            if pattern.is_empty() {
                return Err(invalid(format!("transport.{key} must not be empty")));
            }
        }
        Ok(())
    }
}

/// `[companion]`: the bonding receiver (`srtla_rec`) feeding the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub enabled: bool,
    pub program: String,
    pub source_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
    pub poll_interval_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "srtla_rec".to_string(),
            source_port: 4000,
            destination_host: "localhost".to_string(),
            destination_port: 4001,
            poll_interval_ms: 100,
        }
    }
}

impl CompanionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command(&self) -> ProcessCommand {
        ProcessCommand::new(&self.program)
            .arg(self.source_port.to_string())
            .arg(&self.destination_host)
            .arg(self.destination_port.to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(invalid("companion.program must not be empty"));
        }
        require_nonzero_ms("companion", "poll_interval_ms", self.poll_interval_ms)
    }
}

/// `[health]`: thresholds and smoothing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Maximum mean RTT. Negative disables the check.
    pub rtt_max_ms: f64,
    /// Minimum mean throughput. Negative disables the check.
    pub throughput_min_mbps: f64,
    pub window_size: usize,
    /// Expected spacing between metrics records.
    pub sample_period_ms: u64,
    /// Metrics older than `sample_period_ms * stale_multiplier` are stale.
    pub stale_multiplier: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            rtt_max_ms: 1000.0,
            throughput_min_mbps: 1.0,
            window_size: 5,
            sample_period_ms: 1000,
            stale_multiplier: 5,
        }
    }
}

impl HealthConfig {
    /// RTT ceiling, `None` when disabled.
    pub fn rtt_threshold(&self) -> Option<f64> {
        (self.rtt_max_ms >= 0.0).then_some(self.rtt_max_ms)
    }

    /// Throughput floor, `None` when disabled.
    pub fn throughput_threshold(&self) -> Option<f64> {
        (self.throughput_min_mbps >= 0.0).then_some(self.throughput_min_mbps)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms).saturating_mul(self.stale_multiplier)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(invalid(format!("{section}.window_size must be greater than zero")));
        }
        if !self.rtt_max_ms.is_finite() || !self.throughput_min_mbps.is_finite() {
            return Err(invalid(format!("{section} thresholds must be finite numbers")));
        }
        require_nonzero_ms(section, "sample_period_ms", self.sample_period_ms)?;
        if self.stale_multiplier == 0 {
            return Err(invalid(format!(
                "{section}.stale_multiplier must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Timers shared by both control loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopTiming {
    pub tick_interval_ms: u64,
    pub stabilize_ms: u64,
    pub cooldown_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            stabilize_ms: 10_000,
            cooldown_ms: 30_000,
            call_timeout_ms: 2000,
        }
    }
}

impl LoopTiming {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        require_nonzero_ms(section, "tick_interval_ms", self.tick_interval_ms)?;
        require_nonzero_ms(section, "call_timeout_ms", self.call_timeout_ms)
    }
}

/// `[failover]`: live/standby scene switching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub timing: LoopTiming,
    pub live_scene: String,
    pub standby_scene: String,
    /// Media source toggled after switching back to live.
    pub media_source: Option<String>,
    pub lock_key: String,
    pub health: Option<HealthConfig>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timing: LoopTiming::default(),
            live_scene: "Live".to_string(),
            standby_scene: "BRB".to_string(),
            media_source: None,
            lock_key: "scene_lock".to_string(),
            health: None,
        }
    }
}

impl FailoverConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate("failover")?;
        if self.live_scene.trim().is_empty() || self.standby_scene.trim().is_empty() {
            return Err(invalid("failover scene names must not be empty"));
        }
        if self.live_scene == self.standby_scene {
            return Err(invalid("failover.live_scene and failover.standby_scene must differ"));
        }
        if self.lock_key.is_empty() {
            return Err(invalid("failover.lock_key must not be empty"));
        }
        Ok(())
    }
}

/// `[bitrate]`: encoder bitrate backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub timing: LoopTiming,
    /// Bits per second at ladder index 0.
    pub preferred_bitrate: u32,
    /// Lower rungs, highest first.
    pub fallback_bitrates: Vec<u32>,
    pub lock_key: String,
    pub health: Option<HealthConfig>,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timing: LoopTiming::default(),
            preferred_bitrate: 6_000_000,
            fallback_bitrates: vec![4_500_000, 3_000_000, 1_500_000],
            lock_key: "bitrate_lock".to_string(),
            health: None,
        }
    }
}

impl BitrateConfig {
    /// Preferred bitrate followed by the fallbacks.
    pub fn ladder(&self) -> Vec<u32> {
        std::iter::once(self.preferred_bitrate)
            .chain(self.fallback_bitrates.iter().copied())
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate("bitrate")?;
        let ladder = self.ladder();
        if ladder.contains(&0) {
            return Err(invalid("bitrate ladder must not contain zero"));
        }
        let mut seen = HashSet::new();
        if !ladder.iter().all(|rate| seen.insert(*rate)) {
            return Err(invalid("bitrate ladder must not contain duplicates"));
        }
        if self.lock_key.is_empty() {
            return Err(invalid("bitrate.lock_key must not be empty"));
        }
        Ok(())
    }
}

/// `[lock]`: where the shared manual-lock flags live
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// JSON file shared across processes. Absent keeps flags in memory.
    pub path: Option<PathBuf>,
}
