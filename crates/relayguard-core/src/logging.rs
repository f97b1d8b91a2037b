//! Structured logging setup.
//!
//! One global `tracing` subscriber: an [`EnvFilter`] in front of a stderr
//! layer and, when configured, an append-only file layer. Both layers use
//! the same format (pretty or one JSON object per line).
//!
//! Field names used across the crate:
//! - `unit`: supervised unit (`transport`, `companion`)
//! - `control`: control loop (`failover`, `bitrate`)
//! - `pid`, `pgid`: child process identifiers
//! - `rtt_ms`, `throughput_mbps`: window means at evaluation time
//!
//! The transport passphrase must never reach a log line. Commands are
//! logged through [`crate::supervisor::ProcessCommand`]'s `Display`, which
//! masks it.

use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub use crate::config::LogFormat;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A level name or an `EnvFilter` directive. `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    /// Also append to this file (dir created 0700, file 0600 on unix).
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.as_str().to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter {0:?}")]
    InvalidLevel(String),

    #[error("cannot open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("cannot install subscriber: {0}")]
    SetSubscriber(#[from] TryInitError),
}

/// Plain level names accepted by `[logging] level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Trace, Self::Debug, Self::Info, Self::Warn, Self::Error]
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .or_else(|| s.eq_ignore_ascii_case("warning").then_some(Self::Warn))
            .ok_or_else(|| format!("unknown log level {s:?} (trace, debug, info, warn, error)"))
    }
}

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync + 'static>;

fn filter_for(level: &str) -> Result<EnvFilter, LogError> {
    match EnvFilter::try_from_default_env() {
        Ok(from_env) => Ok(from_env),
        Err(_) => EnvFilter::try_new(level).map_err(|_| LogError::InvalidLevel(level.to_string())),
    }
}

/// One output layer in the configured format.
fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Open `path` for appending, tightening permissions on anything we create.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    let fresh = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    #[cfg(unix)]
    if fresh {
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = fresh;
    Ok(file)
}

/// Install the global subscriber. A second call returns
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = filter_for(&config.level)?;
    let mut layers: Vec<BoxedLayer> = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path)?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    tracing_subscriber::registry().with(filter).with(layers).try_init()?;
    let _ = INSTALLED.set(());

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ProcessCommand;
    use std::sync::Arc;

    /// Collects everything written to it.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(format: LogFormat) -> (Capture, impl tracing::Subscriber + Send + Sync) {
        let sink = Capture::default();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(vec![output_layer(format, sink.clone(), false)]);
        (sink, subscriber)
    }

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("Warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(Level::from("error".parse::<LogLevel>().unwrap()), Level::ERROR);
        assert!("verbose".parse::<LogLevel>().unwrap_err().contains("verbose"));
        assert!("".parse::<LogLevel>().is_err());
    }

    #[test]
    fn config_defaults_fill_missing_keys() {
        let config: LogConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, None);
    }

    #[test]
    fn filter_accepts_directives_and_rejects_garbage() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(filter_for("warn,relayguard_core::control_loop=debug").is_ok());
        assert!(matches!(
            filter_for("relayguard_core=loud"),
            Err(LogError::InvalidLevel(_))
        ));
    }

    #[test]
    fn json_lines_carry_structured_fields() {
        let (sink, subscriber) = capture(LogFormat::Json);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(control = "failover", cooldown_remaining_ms = 1500u64, "degrade suppressed");
            tracing::debug!("filtered out");
        });

        let text = sink.text();
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event["level"], "WARN");
        assert_eq!(event["control"], "failover");
        assert_eq!(event["cooldown_remaining_ms"], 1500);
        assert_eq!(event["message"], "degrade suppressed");
    }

    #[test]
    fn pretty_output_without_ansi_is_plain() {
        let (sink, subscriber) = capture(LogFormat::Pretty);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(unit = "companion", "companion output");
        });
        let text = sink.text();
        assert!(text.contains("companion output"));
        assert!(text.contains("unit=\"companion\""));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn passphrase_never_reaches_the_log() {
        let (sink, subscriber) = capture(LogFormat::Json);
        let secret = "0123456789abcdef0123456789abcdef";
        let command = ProcessCommand::new("srt-live-transmit")
            .arg(format!("srt://:9000?passphrase={secret}"))
            .arg("udp://127.0.0.1:5000")
            .with_secret(secret);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(unit = "transport", command = %command, "process started");
        });

        let text = sink.text();
        assert!(text.contains("srt-live-transmit"));
        assert!(!text.contains(secret));
    }

    #[cfg(unix)]
    #[test]
    fn log_file_and_directory_are_private() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("relayguard.log");
        open_log_file(&path).unwrap();

        let dir_mode = std::fs::metadata(tmp.path().join("logs")).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn existing_log_file_is_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relayguard.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        io::Write::write_all(&mut file, b"later\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nlater\n");
    }
}
