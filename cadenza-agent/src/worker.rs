//! Worker subprocess supervision.
//!
//! Spawns the build worker with a sanitised environment and manages the
//! bidirectional framed IPC on its stdio: a command pump into stdin, an
//! event pump off stdout (log-bearing events go to the logger bus,
//! structural events to the caller), and a stderr pump for human
//! diagnostics. The supervise loop enforces wall-clock and silence
//! timeouts and handles cancellation with SIGTERM, a grace period, then
//! SIGKILL — all signals hit the worker's whole process group.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use cadenza_logger::LoggerBus;
use cadenza_protocol::{Command, Event, FrameReader, FrameWriter};

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker executable.
    pub program: PathBuf,
    /// Extra options forwarded verbatim as the worker's argv.
    pub extra_args: Vec<String>,
    /// Wall-clock budget for the whole build.
    pub wall_timeout: Duration,
    /// Max time without a byte on worker stdout/stderr.
    pub silence_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

/// Structural events surfaced to the task runner. Log-bearing events are
/// consumed by the supervisor and never reach the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    BuildResult(bool),
    Exception(String),
}

/// How the worker run ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    Exited(std::process::ExitStatus),
    WallTimeout,
    SilenceTimeout,
    /// Killed after external cancellation or a fatal event-stream error.
    Cancelled,
}

/// Handle to a supervised worker.
pub struct WorkerHandle {
    /// Command channel; `None` is the sentinel that closes worker stdin.
    pub commands: mpsc::Sender<Option<Command>>,
    /// Structural events, in arrival order.
    pub events: mpsc::Receiver<WorkerEvent>,
    join: JoinHandle<Result<WorkerOutcome, AgentError>>,
}

impl WorkerHandle {
    /// Wait for worker exit and pump drain.
    pub async fn wait(self) -> Result<WorkerOutcome, AgentError> {
        self.join
            .await
            .map_err(|e| AgentError::Spawn(format!("supervisor task died: {e}")))?
    }
}

/// Spawn the worker and its supervisor.
///
/// `stderr_line` receives each worker stderr line; it must not block.
/// `cancel` is edge-triggered: the first `true` stops command pumping,
/// closes stdin, and begins the kill sequence.
pub fn spawn_worker(
    config: WorkerConfig,
    bus: LoggerBus,
    stderr_line: impl Fn(String) + Send + Sync + 'static,
    cancel: watch::Receiver<bool>,
) -> Result<WorkerHandle, AgentError> {
    let mut command = tokio::process::Command::new(&config.program);
    command
        .args(&config.extra_args)
        .env_clear()
        .env("NIX_PATH", "")
        .current_dir("/")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        AgentError::Spawn(format!(
            "Failed to spawn worker '{}': {e}",
            config.program.display()
        ))
    })?;

    let (commands_tx, commands_rx) = mpsc::channel(8);
    let (events_tx, events_rx) = mpsc::channel(8);

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AgentError::Spawn("worker stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Spawn("worker stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::Spawn("worker stderr not captured".into()))?;

    // Raised by the event pump on a fatal stream condition; folded into
    // the same kill path as external cancellation.
    let (abort_tx, abort_rx) = watch::channel(false);
    // Raised by the supervise loop to stop the command pump.
    let (stop_tx, stop_rx) = watch::channel(false);

    let last_output = Arc::new(Mutex::new(Instant::now()));

    let command_pump = spawn_command_pump(stdin, commands_rx, stop_rx);
    let event_pump = spawn_event_pump(stdout, bus, events_tx, abort_tx, Arc::clone(&last_output));
    let stderr_pump = spawn_stderr_pump(stderr, stderr_line, Arc::clone(&last_output));

    let join = tokio::spawn(async move {
        let outcome = supervise(&mut child, &config, last_output, cancel, abort_rx).await?;

        // Stop the command pump (closing stdin) and wait for all three
        // pumps to drain before reporting the outcome.
        let _ = stop_tx.send(true);
        let _ = command_pump.await;
        let _ = event_pump.await;
        let _ = stderr_pump.await;

        Ok(outcome)
    });

    Ok(WorkerHandle {
        commands: commands_tx,
        events: events_rx,
        join,
    })
}

fn spawn_command_pump(
    stdin: tokio::process::ChildStdin,
    mut commands: mpsc::Receiver<Option<Command>>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(stdin);
        loop {
            tokio::select! {
                next = commands.recv() => match next {
                    Some(Some(command)) => {
                        if let Err(e) = writer.write_frame(&command.encode()).await {
                            // The worker may have exited before reading;
                            // the supervise loop will report the outcome.
                            warn!("Failed to send command to worker: {e}");
                            break;
                        }
                    }
                    // Sentinel or sender gone: no more commands.
                    Some(None) | None => break,
                },
                _ = stop.changed() => break,
            }
        }
        // Dropping the writer closes worker stdin.
    })
}

fn spawn_event_pump(
    stdout: tokio::process::ChildStdout,
    bus: LoggerBus,
    events: mpsc::Sender<WorkerEvent>,
    abort: watch::Sender<bool>,
    last_output: Arc<Mutex<Instant>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = FrameReader::new(stdout);
        let mut saw_result = false;
        loop {
            let payload = match reader.read_frame().await {
                Ok(Some(payload)) => payload,
                // Clean EOF: worker closed stdout.
                Ok(None) => break,
                Err(e) => {
                    warn!("Worker event stream error: {e}");
                    let _ = events
                        .send(WorkerEvent::Exception(format!("event stream error: {e}")))
                        .await;
                    let _ = abort.send(true);
                    break;
                }
            };
            *last_output.lock().unwrap() = Instant::now();

            match Event::decode(&payload) {
                Ok(Event::Log(entry)) => bus.push(entry),
                Ok(Event::BuildResult(success)) => {
                    if saw_result {
                        warn!("Ignoring structural event after BuildResult");
                        continue;
                    }
                    saw_result = true;
                    let _ = events.send(WorkerEvent::BuildResult(success)).await;
                }
                Ok(Event::Exception(text)) => {
                    // BuildResult is terminal; a late exception must not
                    // overturn it.
                    if saw_result {
                        warn!("Ignoring structural event after BuildResult");
                        continue;
                    }
                    let _ = events.send(WorkerEvent::Exception(text)).await;
                    let _ = abort.send(true);
                    break;
                }
                Err(e) => {
                    warn!("Undecodable worker event: {e}");
                    let _ = events
                        .send(WorkerEvent::Exception(format!("bad event frame: {e}")))
                        .await;
                    let _ = abort.send(true);
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_pump(
    stderr: tokio::process::ChildStderr,
    stderr_line: impl Fn(String) + Send + Sync + 'static,
    last_output: Arc<Mutex<Instant>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            *last_output.lock().unwrap() = Instant::now();
            stderr_line(line);
        }
    })
}

/// Wait for worker exit, enforcing timeouts and cancellation.
async fn supervise(
    child: &mut Child,
    config: &WorkerConfig,
    last_output: Arc<Mutex<Instant>>,
    mut cancel: watch::Receiver<bool>,
    mut abort: watch::Receiver<bool>,
) -> Result<WorkerOutcome, AgentError> {
    let wall_deadline = Instant::now() + config.wall_timeout;

    if *cancel.borrow() {
        terminate(child, config.kill_grace).await;
        return Ok(WorkerOutcome::Cancelled);
    }

    // A watch sender may be dropped while the worker is still running
    // (the event pump owns the abort side and exits on stdout EOF); a
    // dead channel must not be polled again or the loop spins.
    let mut cancel_alive = true;
    let mut abort_alive = true;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    AgentError::Spawn(format!("failed to wait for worker: {e}"))
                })?;
                debug!("Worker exited with {status}");
                return Ok(WorkerOutcome::Exited(status));
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if Instant::now() >= wall_deadline {
                    warn!("Worker exceeded wall-clock timeout, killing");
                    terminate(child, config.kill_grace).await;
                    return Ok(WorkerOutcome::WallTimeout);
                }
                let silent_for = last_output.lock().unwrap().elapsed();
                if silent_for >= config.silence_timeout {
                    warn!("Worker silent for {silent_for:?}, killing");
                    terminate(child, config.kill_grace).await;
                    return Ok(WorkerOutcome::SilenceTimeout);
                }
            }
            changed = cancel.changed(), if cancel_alive => {
                if changed.is_err() {
                    cancel_alive = false;
                } else if *cancel.borrow() {
                    debug!("Cancellation requested, killing worker");
                    terminate(child, config.kill_grace).await;
                    return Ok(WorkerOutcome::Cancelled);
                }
            }
            changed = abort.changed(), if abort_alive => {
                if changed.is_err() {
                    abort_alive = false;
                } else if *abort.borrow() {
                    debug!("Fatal worker event, killing worker");
                    terminate(child, config.kill_grace).await;
                    return Ok(WorkerOutcome::Cancelled);
                }
            }
        }
    }
}

/// SIGTERM the worker's process group, wait out the grace period, then
/// SIGKILL. The child was spawned with `process_group(0)`, so its pid is
/// the pgid. Also used by the runner's realise fallback.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    let _ = killpg(pgid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!("Worker ignored SIGTERM, sending SIGKILL");
    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}
