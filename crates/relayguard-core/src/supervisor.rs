//! External process supervision.
//!
//! A [`ProcessSupervisor`] owns at most one child process at a time. The
//! child runs in its own process group with stdout and stderr each drained
//! by a reader task into a single channel, so [`ProcessSupervisor::read_lines`]
//! never blocks: it returns whatever complete lines have arrived since the
//! last call, or nothing.
//!
//! Exit status is not polled. A dead child simply stops producing lines and
//! downstream staleness checks take it from there.
//!
//! Units built on a supervisor implement [`Supervised`] and are driven by
//! [`spawn_supervised`], which calls `on_tick` at a fixed interval until the
//! returned [`SupervisorHandle`] is told to stop.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{SpawnError, SupervisorError};

/// Grace period between SIGTERM and SIGKILL when tearing a child down.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Program and arguments for one supervised executable.
///
/// Launched directly, without a shell. When a secret is attached it is
/// masked wherever the command is displayed.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip)]
    secret: Option<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Mask `secret` in `Display`/`Debug` output.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = (!secret.is_empty()).then_some(secret);
        self
    }

    fn masked(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) => text.replace(secret.as_str(), "****"),
            None => text.to_string(),
        }
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = self.masked(arg);
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCommand")
            .field("program", &self.program)
            .field(
                "args",
                &self.args.iter().map(|a| self.masked(a)).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The one live child of a supervisor.
struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
    started_at_ms: u64,
    lines: mpsc::UnboundedReceiver<Vec<u8>>,
    readers: Vec<JoinHandle<()>>,
}

/// Lifecycle owner for one external executable.
pub struct ProcessSupervisor {
    unit: String,
    command: ProcessCommand,
    handle: Option<ProcessHandle>,
    restarts: u32,
}

impl ProcessSupervisor {
    pub fn new(unit: impl Into<String>, command: ProcessCommand) -> Self {
        Self {
            unit: unit.into(),
            command,
            handle: None,
            restarts: 0,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn command(&self) -> &ProcessCommand {
        &self.command
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid)
    }

    /// Wall-clock start time of the current child.
    pub fn started_at_ms(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.started_at_ms)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.handle.as_ref().map(|h| h.started_at.elapsed())
    }

    /// Successful restarts since construction.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Launch the command. Must be called from within a tokio runtime.
    ///
    /// A child that is already running is killed first, so there is never
    /// more than one.
    pub fn start(&mut self) -> Result<(), SpawnError> {
        if let Some(mut previous) = self.handle.take() {
            warn!(unit = %self.unit, pid = ?previous.pid, "start called while running; killing previous child");
            signal_group(&self.unit, &mut previous.child, Teardown::Kill);
            abort_readers(&previous);
        }

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError {
            unit: self.unit.clone(),
            program: self.command.program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx));
        }

        let pid = child.id();
        let started_at_ms = epoch_ms();
        info!(
            unit = %self.unit,
            pid = ?pid,
            pgid = ?pid,
            started_at_ms,
            command = %self.command,
            "process started"
        );

        self.handle = Some(ProcessHandle {
            child,
            pid,
            started_at: Instant::now(),
            started_at_ms,
            lines: rx,
            readers,
        });
        Ok(())
    }

    /// Next complete output line, if one is waiting.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        self.handle.as_mut()?.lines.try_recv().ok()
    }

    /// Every complete output line waiting right now, oldest first.
    ///
    /// Returns an empty vec when nothing arrived, when the process has
    /// exited, or when no process was ever started.
    pub fn read_lines(&mut self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line() {
            lines.push(line);
        }
        lines
    }

    /// Signal the process group to terminate and reap the child.
    ///
    /// Escalates to SIGKILL after a short grace period. Idempotent.
    pub async fn terminate(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        signal_group(&self.unit, &mut handle.child, Teardown::Terminate);
        match tokio::time::timeout(TERMINATE_GRACE, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!(unit = %self.unit, pid = ?handle.pid, %status, "process exited");
            }
            Ok(Err(err)) => {
                warn!(unit = %self.unit, pid = ?handle.pid, error = %err, "failed to reap process");
            }
            Err(_) => {
                warn!(
                    unit = %self.unit,
                    pid = ?handle.pid,
                    grace_ms = TERMINATE_GRACE.as_millis() as u64,
                    "process ignored SIGTERM; killing"
                );
                signal_group(&self.unit, &mut handle.child, Teardown::Kill);
                if let Err(err) = handle.child.wait().await {
                    warn!(unit = %self.unit, pid = ?handle.pid, error = %err, "failed to reap process");
                }
            }
        }
        abort_readers(&handle);
    }

    /// SIGKILL the process group and reap the child. Idempotent.
    pub async fn kill(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        signal_group(&self.unit, &mut handle.child, Teardown::Kill);
        match handle.child.wait().await {
            Ok(status) => info!(unit = %self.unit, pid = ?handle.pid, %status, "process killed"),
            Err(err) => warn!(unit = %self.unit, pid = ?handle.pid, error = %err, "failed to reap process"),
        }
        abort_readers(&handle);
    }

    /// Tear the current child down, wait `delay`, and launch the same
    /// command again. Reserved for defect recovery.
    pub async fn restart(&mut self, delay: Duration) -> Result<(), SpawnError> {
        warn!(
            unit = %self.unit,
            pid = ?self.pid(),
            delay_ms = delay.as_millis() as u64,
            "restarting process"
        );
        self.terminate().await;
        tokio::time::sleep(delay).await;
        self.start()?;
        self.restarts = self.restarts.saturating_add(1);
        Ok(())
    }
}

fn abort_readers(handle: &ProcessHandle) {
    for reader in &handle.readers {
        reader.abort();
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(line.last(), Some(b'\n' | b'\r')) {
                        line.pop();
                    }
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "output reader stopped");
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Signal the child's whole process group, falling back to the child alone.
#[cfg(unix)]
fn signal_group(unit: &str, child: &mut Child, teardown: Teardown) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = match teardown {
        Teardown::Terminate => Signal::SIGTERM,
        Teardown::Kill => Signal::SIGKILL,
    };
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        match killpg(Pid::from_raw(pid), signal) {
            Ok(()) => return,
            Err(errno) => debug!(unit, pgid = pid, %signal, %errno, "killpg failed; falling back to kill"),
        }
    }
    if let Err(err) = child.start_kill() {
        debug!(unit, %signal, error = %err, "start_kill failed");
    }
}

#[cfg(not(unix))]
fn signal_group(unit: &str, child: &mut Child, teardown: Teardown) {
    if let Err(err) = child.start_kill() {
        debug!(unit, ?teardown, error = %err, "start_kill failed");
    }
}

/// A unit of work driven by [`spawn_supervised`].
#[async_trait]
pub trait Supervised: Send + 'static {
    fn supervisor(&mut self) -> &mut ProcessSupervisor;

    /// One poll of the unit. Non-fatal errors are logged and the loop
    /// carries on; fatal ones end it.
    async fn on_tick(&mut self) -> Result<(), SupervisorError>;
}

/// Handle to a running tick loop.
pub struct SupervisorHandle {
    unit: String,
    shutdown: watch::Sender<bool>,
    exited: watch::Receiver<bool>,
    task: JoinHandle<Result<(), SupervisorError>>,
}

impl SupervisorHandle {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Ask the loop to stop. The inter-tick wait is interrupted.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Resolves once the loop has ended for any reason.
    pub async fn exited(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to finish. The child is terminated before this
    /// returns.
    pub async fn join(self) -> Result<(), SupervisorError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(SupervisorError::TaskFailed {
                unit: self.unit,
                message: err.to_string(),
            }),
        }
    }

    /// Signal shutdown and wait for the loop.
    pub async fn stop(self) -> Result<(), SupervisorError> {
        self.signal_shutdown();
        self.join().await
    }
}

/// Drive `unit.on_tick()` every `wait_interval` until shutdown or a fatal
/// error. The unit's process is terminated when the loop ends.
#[must_use]
pub fn spawn_supervised<S: Supervised>(mut unit: S, wait_interval: Duration) -> SupervisorHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (exited_tx, exited_rx) = watch::channel(false);
    let name = unit.supervisor().unit().to_string();
    let task_name = name.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(wait_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            unit = %task_name,
            interval_ms = wait_interval.as_millis() as u64,
            "tick loop started"
        );

        let outcome = loop {
            tokio::select! {
                _ = interval.tick() => {
                    match unit.on_tick().await {
                        Ok(()) => {}
                        Err(err) if err.is_fatal() => {
                            error!(unit = %task_name, error = %err, "tick loop stopping on fatal error");
                            break Err(err);
                        }
                        Err(err) => {
                            warn!(unit = %task_name, error = %err, "tick failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!(unit = %task_name, "tick loop shutdown requested");
                    break Ok(());
                }
            }
        };

        unit.supervisor().terminate().await;
        let _ = exited_tx.send(true);
        info!(unit = %task_name, "tick loop stopped");
        outcome
    });

    SupervisorHandle {
        unit: name,
        shutdown: shutdown_tx,
        exited: exited_rx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_secret() {
        let command = ProcessCommand::new("srt-live-transmit")
            .args(["-s", "100"])
            .arg("srt://:4001?passphrase=hunter2hunter2")
            .with_secret("hunter2hunter2");
        let shown = command.to_string();
        assert_eq!(
            shown,
            "srt-live-transmit -s 100 srt://:4001?passphrase=****"
        );
        assert!(!format!("{command:?}").contains("hunter2"));
        assert_eq!(command.args[2], "srt://:4001?passphrase=hunter2hunter2");
    }

    #[test]
    fn display_quotes_args_with_spaces() {
        let command = ProcessCommand::new("echo").arg("two words");
        assert_eq!(command.to_string(), "echo \"two words\"");
    }

    #[test]
    fn empty_secret_is_ignored() {
        let command = ProcessCommand::new("x").arg("a").with_secret("");
        assert_eq!(command.to_string(), "x a");
    }

    #[test]
    fn reads_before_start_are_empty() {
        let mut supervisor = ProcessSupervisor::new("transport", ProcessCommand::new("true"));
        assert!(!supervisor.is_running());
        assert!(supervisor.read_line().is_none());
        assert!(supervisor.read_lines().is_empty());
        assert!(supervisor.pid().is_none());
        assert!(supervisor.started_at_ms().is_none());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let mut supervisor = ProcessSupervisor::new(
            "transport",
            ProcessCommand::new("/nonexistent/relayguard-test-binary"),
        );
        let err = supervisor.start().unwrap_err();
        assert_eq!(err.unit, "transport");
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn terminate_without_child_is_noop() {
        let mut supervisor = ProcessSupervisor::new("companion", ProcessCommand::new("true"));
        supervisor.terminate().await;
        supervisor.kill().await;
        assert!(!supervisor.is_running());
    }

    #[test]
    fn epoch_ms_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_ms() > 1_577_836_800_000);
    }
}
