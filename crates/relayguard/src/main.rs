//! relayguard CLI - unattended SRT relay supervision
//!
//! `relayguard run` starts the relay and keeps it up until Ctrl-C. The
//! `lock`, `unlock` and `status` commands operate on the file-backed lock
//! store a running relay reads, so an operator can freeze or release the
//! control loops from another shell.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use relayguard_core::collaborator::{Encoder, Mixer, RecordingEncoder, RecordingMixer};
use relayguard_core::config::{Passphrase, RelayConfig};
use relayguard_core::error::{ConfigError, Remediation};
use relayguard_core::lock::{FileLockStore, LockStore, MemoryLockStore, SharedLockFlag};
use relayguard_core::logging::init_logging;
use relayguard_core::relay::Relay;
use relayguard_core::supervisor::epoch_ms;
use relayguard_core::telemetry::decode_line;

const DIVIDER: &str = "========================================================================";

#[derive(Parser)]
#[command(name = "relayguard", version)]
#[command(about = "Unattended SRT relay with automatic scene failover and bitrate backoff", long_about = None)]
struct Cli {
    /// Config file (TOML). Built-in defaults are used when it does not exist.
    #[arg(long, global = true, env = "RELAYGUARD_CONFIG", default_value = "relayguard.toml")]
    config: PathBuf,

    /// Shared lock store file. Overrides `[lock].path`.
    #[arg(long, global = true)]
    lock_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay and run until Ctrl-C
    Run {
        /// Drive in-process recording mixer/encoder instead of real ones
        #[arg(long)]
        dry_run: bool,
    },
    /// Set a manual lock; the matching control loop holds still
    Lock {
        #[arg(long, default_value = "scene_lock")]
        key: String,
    },
    /// Clear a manual lock
    Unlock {
        #[arg(long, default_value = "scene_lock")]
        key: String,
    },
    /// Print every lock flag as JSON
    Status,
    /// Decode transport output lines from stdin and print them as JSON
    Decode,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = remediation_for(&err) {
                eprintln!();
                eprint!("{remediation}");
            }
            ExitCode::FAILURE
        }
    }
}

fn remediation_for(err: &anyhow::Error) -> Option<Remediation> {
    if let Some(err) = err.downcast_ref::<relayguard_core::Error>() {
        return err.remediation();
    }
    err.downcast_ref::<ConfigError>().map(ConfigError::remediation)
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;
    let lock_path = cli.lock_file.clone().or_else(|| config.lock.path.clone());

    match cli.command {
        Commands::Decode => decode_stdin(),
        Commands::Run { dry_run } => {
            init_logging(&config.logging).context("failed to initialize logging")?;
            if !cli.config.exists() {
                info!(path = %cli.config.display(), "config file not found; using defaults");
            }
            let store = open_store(lock_path.as_deref())?;
            run_relay(&config, store, dry_run)
        }
        Commands::Lock { key } => {
            let store = require_store(lock_path.as_deref())?;
            SharedLockFlag::new(store, key.as_str()).lock();
            println!("{key}: locked");
            Ok(())
        }
        Commands::Unlock { key } => {
            let store = require_store(lock_path.as_deref())?;
            SharedLockFlag::new(store, key.as_str()).unlock();
            println!("{key}: unlocked");
            Ok(())
        }
        Commands::Status => {
            let path = lock_path.context(
                "no lock store configured; set [lock].path in the config or pass --lock-file",
            )?;
            let store = FileLockStore::open(&path)
                .with_context(|| format!("failed to open lock store {}", path.display()))?;
            let entries: BTreeMap<String, bool> = store
                .entries()
                .with_context(|| format!("failed to read lock store {}", path.display()))?
                .into_iter()
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    RelayConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn open_store(path: Option<&Path>) -> anyhow::Result<Arc<dyn LockStore>> {
    match path {
        Some(path) => Ok(Arc::new(FileLockStore::open(path).with_context(|| {
            format!("failed to open lock store {}", path.display())
        })?)),
        None => Ok(Arc::new(MemoryLockStore::new())),
    }
}

fn require_store(path: Option<&Path>) -> anyhow::Result<Arc<dyn LockStore>> {
    if path.is_none() {
        bail!("no lock store configured; set [lock].path in the config or pass --lock-file");
    }
    open_store(path)
}

fn print_passphrase(passphrase: &Passphrase) {
    println!("{DIVIDER}");
    println!("Generated SRT passphrase (configure it on the sender):");
    println!("{}", passphrase.as_str());
    println!("{DIVIDER}");
}

fn run_relay(config: &RelayConfig, store: Arc<dyn LockStore>, dry_run: bool) -> anyhow::Result<()> {
    let passphrase = config.transport.resolve_passphrase();
    if passphrase.was_generated() {
        print_passphrase(&passphrase);
    }

    let (mixer, encoder) = if dry_run {
        info!("dry run: control loops drive in-process recording collaborators");
        let mixer: Arc<dyn Mixer> = Arc::new(RecordingMixer::new(config.failover.live_scene.as_str()));
        let encoder: Arc<dyn Encoder> = Arc::new(RecordingEncoder::new(config.bitrate.ladder()));
        (Some(mixer), Some(encoder))
    } else {
        (None, None)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let relay = Relay::start(config, &passphrase, mixer, encoder, store).await?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                info!("shutdown requested");
            }
            () = relay.transport_exited() => {
                error!("transport supervisor exited");
            }
        }
        relay.shutdown().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn decode_stdin() -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut line = Vec::new();

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let json = match decode_line(&line, epoch_ms()) {
            Ok(raw) => serde_json::to_string(&raw)?,
            Err(relayguard_core::error::DecodeError::Blank) => continue,
            Err(err) => serde_json::json!({ "kind": "decode_error", "value": err.to_string() }).to_string(),
        };
        writeln!(out, "{json}")?;
    }
    Ok(())
}
