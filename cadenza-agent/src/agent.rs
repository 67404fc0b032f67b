//! Ties the components together: one method runs one build task with its
//! log shipper, and a polling loop feeds tasks from the CI API.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use cadenza_logger::LoggerBus;

use crate::api::{BuildTask, CiApi};
use crate::config::Config;
use crate::error::{AgentError, TaskStatus};
use crate::retry::RetryPolicy;
use crate::shipper::{HttpLogConnector, LogShipper, spawn_shipper};
use crate::task::{LOG_SOCKET_PATH, TaskRunner};

/// Pause between polls when the API has no work.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Agent<A: CiApi> {
    config: Config,
    api: A,
}

impl<A: CiApi> Agent<A> {
    pub fn new(config: Config, api: A) -> Self {
        Self { config, api }
    }

    /// Run one task to completion: wire up the logger bus and shipper,
    /// drive the task runner, drain the logs, report the terminal status.
    pub async fn run_task(&self, task: BuildTask, cancel: watch::Receiver<bool>) -> TaskStatus {
        let bus = LoggerBus::new(self.config.log_bus_capacity);

        let mut shipper_done = match HttpLogConnector::new(
            &task.log_host,
            LOG_SOCKET_PATH,
            &task.log_token,
        ) {
            Ok(connector) => Some(spawn_shipper(LogShipper::new(
                bus.clone(),
                connector,
                RetryPolicy::default(),
                self.config.log_batch_size,
                self.config.close_grace(),
            ))),
            Err(e) => {
                error!("Log shipper unavailable, build log will be lost: {e}");
                None
            }
        };

        let runner = TaskRunner::new(&self.config, &self.api, bus.clone());
        let status = runner.run(&task, cancel).await;

        // Let the shipper drain what the build left behind.
        bus.close();
        if let Some(done) = shipper_done.as_mut() {
            let grace = self.config.close_grace() + Duration::from_secs(1);
            let _ = tokio::time::timeout(grace, done.wait_for(|finished| *finished)).await;
        }

        if let Err(e) = self.api.report_task_status(&task.id, &status).await {
            error!("Failed to report status for task {}: {e}", task.id);
        }
        if status != TaskStatus::Successful {
            eprintln!("cadenza-agent: {}", status.short_reason());
        }
        status
    }

    /// Poll the API for tasks until shutdown. The shutdown signal doubles
    /// as the cancellation signal for the task in flight.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping task loop");
                return Ok(());
            }

            match self.api.poll_build_task().await {
                Ok(Some(task)) => {
                    self.run_task(task, shutdown.clone()).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {}
                    }
                }
                Err(e) => {
                    error!("Task poll failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {}
                    }
                }
            }
        }
    }
}
