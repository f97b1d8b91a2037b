//! relayguard-core: Core library for relayguard
//!
//! This crate supervises an SRT receive relay and keeps the broadcast on
//! air when the incoming link degrades: it switches the mixer to a
//! standby scene and steps the encoder bitrate down, then undoes both
//! once the link has been healthy for long enough.
//!
//! # Architecture
//!
//! ```text
//! srt-live-transmit → Supervisor → TelemetryCollector → watch<Snapshot>
//!                                                           ↓
//!                                  HealthEvaluator → ControlLoop → Mixer / Encoder
//!                                                        ↑
//!                                                   LockStore (manual override)
//! ```
//!
//! # Modules
//!
//! - `supervisor`: Child process lifecycle and the tick-loop driver
//! - `telemetry`: Transport output decoding and link state
//! - `companion`: Optional bonding receiver feeding the transport
//! - `window`: Fixed-capacity sample window
//! - `health`: Smoothed health verdicts
//! - `control_loop`: Degrade / stabilize / recover state machine
//! - `failover`: Scene failover binding
//! - `bitrate`: Bitrate ladder binding
//! - `collaborator`: Mixer and encoder interfaces
//! - `lock`: Manual-lock flags
//! - `relay`: Wires everything together
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bitrate;
pub mod collaborator;
pub mod companion;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod failover;
pub mod health;
pub mod lock;
pub mod logging;
pub mod relay;
pub mod supervisor;
pub mod telemetry;
pub mod window;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
