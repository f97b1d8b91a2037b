//! Error types for relayguard-core
//!
//! Every user-facing error can produce a [`Remediation`]: a one-line fix
//! plus optional commands to run and fallbacks to try. The CLI prints it
//! below the error chain.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One suggested next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStep {
    /// A shell command, with what it is for.
    Run { label: String, command: String },
    /// Free-form fallback advice.
    Otherwise(String),
}

/// How to get past an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub steps: Vec<RemediationStep>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.steps.push(RemediationStep::Run {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, advice: impl Into<String>) -> Self {
        self.steps.push(RemediationStep::Otherwise(advice.into()));
        self
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "To fix: {}", self.summary)?;
        for step in &self.steps {
            match step {
                RemediationStep::Run { label, command } => writeln!(f, "  $ {command}    # {label}")?,
                RemediationStep::Otherwise(advice) => writeln!(f, "  or: {advice}")?,
            }
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An external executable could not be launched
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    /// Supervisor tick loop or restart failures
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Mixer/encoder call failures
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Lock store and log file access
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock store contents
    #[error("Lock store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operator override targeted a control loop that was never started.
    #[error("{control} control is not running")]
    ControlNotRunning { control: &'static str },
}

impl Error {
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Spawn(err) => Some(err.remediation()),
            Self::Supervisor(err) => Some(err.remediation()),
            Self::Collaborator(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Make sure the lock store and log directories exist and are writable.")
                    .alternative("Check `[lock].path` and `[logging].file` in the config."),
            ),
            Self::Json(_) => Some(Remediation::new(
                "The lock store file is corrupt. Delete it; every lock reads as unlocked until set again.",
            )),
            Self::ControlNotRunning { control } => Some(
                Remediation::new(format!("Enable `[{control}]` in the config and supply its collaborator."))
                    .alternative("`relayguard run --dry-run` wires in-process collaborators."),
            ),
        }
    }
}

/// An external executable could not be launched.
///
/// Fatal at startup; never retried automatically.
#[derive(Error, Debug)]
#[error("{unit}: failed to launch `{program}`: {source}")]
pub struct SpawnError {
    /// Supervised unit name (e.g. `transport`, `companion`)
    pub unit: String,
    /// Program that failed to launch
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

impl SpawnError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        if self.source.kind() == std::io::ErrorKind::NotFound {
            Remediation::new(format!(
                "`{}` was not found. Install it or point the config at the binary.",
                self.program
            ))
            .command("Locate binary", format!("command -v {}", self.program))
            .alternative("Set an absolute path in the `program` key of the relevant section.")
        } else {
            Remediation::new(format!(
                "`{}` exists but could not be started. Check permissions.",
                self.program
            ))
            .command("Check permissions", format!("ls -l \"$(command -v {})\"", self.program))
        }
    }
}

/// A line of process output could not be decoded into a [`crate::telemetry::RawLine`].
///
/// Silently dropped and counted by the collector; never fatal.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("line is blank")]
    Blank,
}

/// Supervisor-level failures.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Defect-recovery restart could not relaunch the process.
    #[error("{unit}: restart failed, process cannot self-heal: {source}")]
    RestartFailed {
        unit: String,
        #[source]
        source: SpawnError,
    },

    /// The tick loop task panicked or was cancelled.
    #[error("{unit}: tick loop task failed: {message}")]
    TaskFailed { unit: String, message: String },
}

impl SupervisorError {
    /// Fatal errors end the tick loop; everything else is logged and the loop continues.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RestartFailed { .. } | Self::TaskFailed { .. })
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RestartFailed { source, .. } => Remediation::new(
                "The transport was restarted after a clock fault but did not come back. Restart relayguard.",
            )
            .alternative(source.remediation().summary),
            Self::TaskFailed { .. } => {
                Remediation::new("A supervisor task stopped unexpectedly. Check logs and restart.")
            }
        }
    }
}

/// A mixer or encoder call failed or did not complete in time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    /// Build a [`CollaboratorError::Failed`].
    #[must_use]
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            operation,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Timeout { operation, .. } | Self::Failed { operation, .. } => operation,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Timeout { timeout_ms, .. } => Remediation::new(format!(
                "The mixer/encoder did not answer within {timeout_ms} ms. Check that it is running."
            ))
            .alternative("Raise `call_timeout_ms` if the collaborator is slow but healthy."),
            Self::Failed { .. } => Remediation::new(
                "The mixer/encoder rejected the call. Check scene names and encoder settings.",
            ),
        }
    }
}

/// `relayguard.toml` could not be read, parsed or validated.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { path, .. } => {
                Remediation::new(format!("Make sure {} exists and is readable.", path.display()))
                    .command("Check file", format!("ls -l {}", path.display()))
            }
            Self::Parse(_) => Remediation::new("Fix the TOML syntax error and retry.")
                .alternative("Compare against relayguard.example.toml."),
            Self::Invalid(_) => Remediation::new("Correct the reported value and retry.")
                .alternative("Compare against relayguard.example.toml."),
        }
    }
}
