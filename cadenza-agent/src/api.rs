//! The CI API surface the build core consumes, and its HTTP binding.
//!
//! Every call is wrapped in the default retry policy: transport failures
//! and 5xx responses are retried with backoff, 4xx responses are not.
//! All emitted events are additive and the server tolerates duplicates,
//! so re-delivery after a retried call is safe.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, TaskStatus};
use crate::retry::{CallError, RetryPolicy, with_retry};

/// One unit of work handed to the agent: realise a derivation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildTask {
    pub id: String,
    pub drv_path: String,
    /// Output paths of input derivations, already realised.
    pub input_paths: Vec<String>,
    /// Opaque auth token for the build-log socket.
    pub log_token: String,
    /// Host of the build-log socket.
    pub log_host: String,
}

/// Metadata of one realised derivation output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    pub deriver: String,
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
}

/// A remote content-addressed store that mirrors realised outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushCache {
    pub id: String,
    pub uri: String,
}

/// Progress events appended to a build via `update_build`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BuildEvent {
    OutputInfo(OutputInfo),
    Pushed { cache: String },
    Done { success: bool },
}

/// RPC surface of the CI API consumed by the build core.
///
/// Implementations must be safe to call concurrently; the trait is used
/// generically so tests can substitute a recording fake.
pub trait CiApi: Send + Sync {
    /// Fetch the next build task, if any.
    fn poll_build_task(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<BuildTask>, AgentError>> + Send;

    /// Append build events. Idempotent on the server side.
    fn update_build(
        &self,
        task_id: &str,
        events: &[BuildEvent],
    ) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;

    /// Append raw build stderr bytes.
    fn write_log(
        &self,
        task_id: &str,
        token: &str,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;

    /// List the caches that realised outputs should be pushed to.
    fn get_active_push_caches(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<PushCache>, AgentError>> + Send;

    /// Report the task's terminal status. Called exactly once per task.
    fn report_task_status(
        &self,
        task_id: &str,
        status: &TaskStatus,
    ) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;
}

#[derive(Serialize)]
struct UpdateBuildRequest<'a> {
    events: &'a [BuildEvent],
}

#[derive(Serialize)]
struct ReportStatusRequest<'a> {
    status: &'a str,
    reason: Option<&'a str>,
}

/// HTTP binding of [`CiApi`].
pub struct HttpCiApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl HttpCiApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| AgentError::api(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            policy: RetryPolicy::default(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send a request and classify the outcome for the retry loop.
    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, CallError> {
        let response = builder
            .send()
            .await
            .map_err(|e| CallError::transient(format!("{what}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(CallError::transient(format!("{what}: {status}: {body}")))
        } else {
            Err(CallError::Permanent(AgentError::api(format!(
                "{what}: {status}: {body}"
            ))))
        }
    }
}

impl CiApi for HttpCiApi {
    async fn poll_build_task(&self) -> Result<Option<BuildTask>, AgentError> {
        with_retry(&self.policy, "poll build task", || async {
            let response = self
                .execute(
                    self.request(reqwest::Method::POST, "/api/v1/tasks/poll"),
                    "poll build task",
                )
                .await?;
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                return Ok(None);
            }
            response
                .json::<BuildTask>()
                .await
                .map(Some)
                .map_err(|e| CallError::Permanent(AgentError::api(format!("task decode: {e}"))))
        })
        .await
    }

    async fn update_build(&self, task_id: &str, events: &[BuildEvent]) -> Result<(), AgentError> {
        with_retry(&self.policy, "update build", || async {
            self.execute(
                self.request(
                    reqwest::Method::POST,
                    &format!("/api/v1/builds/{task_id}/events"),
                )
                .json(&UpdateBuildRequest { events }),
                "update build",
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn write_log(&self, task_id: &str, token: &str, bytes: &[u8]) -> Result<(), AgentError> {
        with_retry(&self.policy, "write log", || async {
            self.execute(
                self.request(reqwest::Method::POST, &format!("/api/v1/builds/{task_id}/log"))
                    .bearer_auth(token)
                    .body(bytes.to_vec()),
                "write log",
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_active_push_caches(&self) -> Result<Vec<PushCache>, AgentError> {
        with_retry(&self.policy, "get push caches", || async {
            let response = self
                .execute(
                    self.request(reqwest::Method::GET, "/api/v1/push-caches"),
                    "get push caches",
                )
                .await?;
            response
                .json::<Vec<PushCache>>()
                .await
                .map_err(|e| CallError::Permanent(AgentError::api(format!("cache decode: {e}"))))
        })
        .await
    }

    async fn report_task_status(
        &self,
        task_id: &str,
        status: &TaskStatus,
    ) -> Result<(), AgentError> {
        let (label, reason) = match status {
            TaskStatus::Successful => ("successful", None),
            TaskStatus::Terminated => ("terminated", None),
            TaskStatus::Exceptional(reason) => ("exceptional", Some(reason.as_str())),
        };
        with_retry(&self.policy, "report task status", || async {
            self.execute(
                self.request(
                    reqwest::Method::POST,
                    &format!("/api/v1/tasks/{task_id}/status"),
                )
                .json(&ReportStatusRequest {
                    status: label,
                    reason,
                }),
                "report task status",
            )
            .await?;
            Ok(())
        })
        .await
    }
}
