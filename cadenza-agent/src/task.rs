//! Drives one build task from spawn to terminal status.
//!
//! The runner is a linear state machine: spawn the worker, send the one
//! `Build` command, fold worker events and exit status into a build
//! outcome, then post-process (query outputs, emit metadata, push to
//! caches) on success. Fatal conditions thread through as an explicit
//! `TaskStatus` value; every task yields exactly one terminal status and
//! `Done` is the last event emitted for it.

use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use cadenza_logger::{BuildLogger, BusLogger, LoggerBus};
use cadenza_protocol::log::Level;
use cadenza_protocol::{Command, LogSettings};

use crate::api::{BuildEvent, BuildTask, CiApi};
use crate::config::Config;
use crate::error::TaskStatus;
use crate::outputs::OutputInspector;
use crate::push::CachePusher;
use crate::retry::RetryPolicy;
use crate::worker::{WorkerConfig, WorkerEvent, WorkerOutcome, spawn_worker};

/// Path component of the build-log socket endpoint.
pub const LOG_SOCKET_PATH: &str = "/api/v1/logs/build/socket";

/// Flush worker stderr to the API once the buffer reaches this size.
const LOG_FLUSH_BYTES: usize = 32 * 1024;

pub struct TaskRunner<'a, A: CiApi> {
    config: &'a Config,
    api: &'a A,
    bus: LoggerBus,
    push_retry: RetryPolicy,
}

impl<'a, A: CiApi> TaskRunner<'a, A> {
    pub fn new(config: &'a Config, api: &'a A, bus: LoggerBus) -> Self {
        Self {
            config,
            api,
            bus,
            push_retry: RetryPolicy::default(),
        }
    }

    /// Override the cache-push retry policy.
    pub fn with_push_retry(mut self, policy: RetryPolicy) -> Self {
        self.push_retry = policy;
        self
    }

    /// Run the task to its terminal status.
    pub async fn run(&self, task: &BuildTask, cancel: watch::Receiver<bool>) -> TaskStatus {
        info!("Starting build task {} for {}", task.id, task.drv_path);

        let build = match &self.config.worker_path {
            Some(worker) => self.run_worker_build(task, worker.clone(), cancel).await,
            None => self.run_realise_build(task, cancel).await,
        };

        let status = match build {
            Ok(()) => match self.postprocess(task).await {
                Ok(()) => {
                    self.emit(task, vec![BuildEvent::Done { success: true }])
                        .await;
                    TaskStatus::Successful
                }
                Err(status) => {
                    self.emit(task, vec![BuildEvent::Done { success: false }])
                        .await;
                    status
                }
            },
            Err(status) => {
                self.emit(task, vec![BuildEvent::Done { success: false }])
                    .await;
                status
            }
        };

        info!("Task {} finished: {:?}", task.id, status);
        status
    }

    /// Supervise a worker subprocess through one build.
    async fn run_worker_build(
        &self,
        task: &BuildTask,
        worker_path: std::path::PathBuf,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), TaskStatus> {
        let command = Command::Build {
            drv_path: task.drv_path.clone(),
            input_paths: task.input_paths.clone(),
            log_settings: LogSettings {
                token: task.log_token.clone(),
                path: LOG_SOCKET_PATH.to_string(),
                host: task.log_host.clone(),
            },
        };

        let worker_config = WorkerConfig {
            program: worker_path,
            extra_args: self.config.extra_nix_options.clone(),
            wall_timeout: self.config.build_timeout(),
            silence_timeout: self.config.silence_timeout(),
            kill_grace: self.config.kill_grace(),
        };

        let (stderr_tx, mut stderr_rx) = mpsc::channel::<String>(256);
        let mut handle = spawn_worker(
            worker_config,
            self.bus.clone(),
            move |line| {
                // Dropping a line under pressure beats stalling the pump.
                let _ = stderr_tx.try_send(line);
            },
            cancel,
        )
        .map_err(|e| TaskStatus::Exceptional(e.to_string()))?;

        if handle.commands.send(Some(command)).await.is_err() {
            return Err(TaskStatus::Exceptional(
                "worker rejected build command".into(),
            ));
        }
        // One build per spawn; close stdin behind it.
        let _ = handle.commands.send(None).await;

        let mut build_result: Option<bool> = None;
        let mut exception: Option<String> = None;
        let mut log_buf: Vec<u8> = Vec::new();
        let mut stderr_open = true;

        loop {
            tokio::select! {
                event = handle.events.recv() => match event {
                    Some(WorkerEvent::BuildResult(success)) => {
                        debug!("Worker reported build result: {success}");
                        build_result = Some(success);
                    }
                    Some(WorkerEvent::Exception(text)) => {
                        warn!("Worker exception: {text}");
                        exception.get_or_insert(text);
                    }
                    None => break,
                },
                line = stderr_rx.recv(), if stderr_open => match line {
                    Some(line) => {
                        log_buf.extend_from_slice(line.as_bytes());
                        log_buf.push(b'\n');
                        if log_buf.len() >= LOG_FLUSH_BYTES {
                            self.flush_log(task, &mut log_buf).await;
                        }
                    }
                    None => stderr_open = false,
                },
            }
        }

        // `wait` drains all three pumps, so after it no more stderr lines
        // can be in flight; pick up the stragglers and flush.
        let outcome = handle.wait().await;
        while let Ok(line) = stderr_rx.try_recv() {
            log_buf.extend_from_slice(line.as_bytes());
            log_buf.push(b'\n');
        }
        self.flush_log(task, &mut log_buf).await;

        let outcome = outcome.map_err(|e| TaskStatus::Exceptional(e.to_string()))?;

        if let Some(text) = exception {
            return Err(TaskStatus::Exceptional(text));
        }

        match outcome {
            WorkerOutcome::Exited(status) => match build_result {
                None => Err(TaskStatus::Exceptional("Build did not complete".into())),
                Some(false) => Err(TaskStatus::Terminated),
                Some(true) if status.success() => Ok(()),
                Some(true) => Err(TaskStatus::Exceptional(format!(
                    "worker exited with {status} after reporting success"
                ))),
            },
            WorkerOutcome::WallTimeout => {
                Err(TaskStatus::Exceptional("Build timed out".into()))
            }
            WorkerOutcome::SilenceTimeout => Err(TaskStatus::Exceptional(
                "Build produced no output for too long".into(),
            )),
            WorkerOutcome::Cancelled => Err(TaskStatus::Exceptional("Build cancelled".into())),
        }
    }

    /// Fallback when no worker executable is configured: drive
    /// `nix-store --realise` directly. Wall-clock and silence limits are
    /// enforced by Nix via `--timeout`/`--max-silent-time`; external
    /// cancellation tears the build down with the same SIGTERM-then-
    /// SIGKILL sequence as the worker path.
    async fn run_realise_build(
        &self,
        task: &BuildTask,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), TaskStatus> {
        let timeout = self.config.build_timeout_secs.to_string();
        let max_silent = self.config.silence_timeout_secs.to_string();

        let mut child = tokio::process::Command::new(&self.config.nix_store_bin)
            .args([
                "--realise",
                "--timeout",
                &timeout,
                "--max-silent-time",
                &max_silent,
                &task.drv_path,
            ])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskStatus::Exceptional(format!("failed to spawn nix-store: {e}")))?;

        let stderr = child.stderr.take().ok_or_else(|| {
            TaskStatus::Exceptional("nix-store stderr not captured".to_string())
        })?;
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        let logger = BusLogger::new(self.bus.clone());
        let mut log_buf: Vec<u8> = Vec::new();
        let mut stderr_open = true;
        let mut cancel_alive = true;

        let status = loop {
            tokio::select! {
                line = lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        logger.log_msg(Level::Info, line.clone());
                        log_buf.extend_from_slice(line.as_bytes());
                        log_buf.push(b'\n');
                        if log_buf.len() >= LOG_FLUSH_BYTES {
                            self.flush_log(task, &mut log_buf).await;
                        }
                    }
                    Ok(None) | Err(_) => stderr_open = false,
                },
                // Reap only once stderr hit EOF so no log lines are lost.
                status = child.wait(), if !stderr_open => {
                    break status.map_err(|e| {
                        TaskStatus::Exceptional(format!("failed to wait for nix-store: {e}"))
                    })?;
                }
                changed = cancel.changed(), if cancel_alive => {
                    if changed.is_err() {
                        cancel_alive = false;
                    } else if *cancel.borrow() {
                        warn!("Cancellation requested, killing nix-store");
                        crate::worker::terminate(&mut child, self.config.kill_grace()).await;
                        self.flush_log(task, &mut log_buf).await;
                        return Err(TaskStatus::Exceptional("Build cancelled".into()));
                    }
                }
            }
        };
        self.flush_log(task, &mut log_buf).await;

        if status.success() {
            Ok(())
        } else {
            Err(TaskStatus::Terminated)
        }
    }

    /// Query outputs, report their metadata, push to the active caches.
    ///
    /// Output-query failure is fatal (`Exceptional`) and skips the push.
    /// Push failures are not: the build is locally realised, so the task
    /// stays successful and only the `Pushed` event is withheld.
    async fn postprocess(&self, task: &BuildTask) -> Result<(), TaskStatus> {
        let inspector =
            OutputInspector::new(&self.config.nix_bin, &self.config.nix_store_bin);
        let outputs = inspector.query_outputs(&task.drv_path).await.map_err(|e| {
            TaskStatus::Exceptional(format!("output query failed: {e}"))
        })?;

        let events: Vec<BuildEvent> = outputs
            .values()
            .cloned()
            .map(BuildEvent::OutputInfo)
            .collect();
        self.emit(task, events).await;

        let caches = match self.api.get_active_push_caches().await {
            Ok(caches) => caches,
            Err(e) => {
                // Distribution is best-effort once the build is realised.
                error!("Failed to fetch push caches, skipping push: {e}");
                return Ok(());
            }
        };

        let paths: Vec<String> = outputs.values().map(|o| o.path.clone()).collect();
        let pusher = CachePusher::new(
            &self.config.nix_bin,
            self.config.cache_push_parallelism,
            self.push_retry.clone(),
        );

        for cache in &caches {
            let outcome = pusher.push_paths(cache, &paths).await;
            if outcome.complete() {
                self.emit(
                    task,
                    vec![BuildEvent::Pushed {
                        cache: cache.id.clone(),
                    }],
                )
                .await;
            } else {
                warn!(
                    "Cache {}: {} of {} paths failed to push, withholding Pushed event",
                    cache.id,
                    outcome.failed_paths.len(),
                    paths.len()
                );
            }
        }

        Ok(())
    }

    /// Append events to the build. Events are additive and the server
    /// tolerates duplicates, so a delivery failure after exhausted
    /// retries is logged rather than escalated.
    async fn emit(&self, task: &BuildTask, events: Vec<BuildEvent>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.api.update_build(&task.id, &events).await {
            error!("Failed to report build events for {}: {e}", task.id);
        }
    }

    async fn flush_log(&self, task: &BuildTask, buf: &mut Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        if let Err(e) = self.api.write_log(&task.id, &task.log_token, buf).await {
            error!("Failed to append build log for {}: {e}", task.id);
        }
        buf.clear();
    }
}
