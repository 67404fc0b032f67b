//! Build execution core of the cadenza CI agent.
//!
//! Given a build task describing a derivation, the agent supervises an
//! isolated worker subprocess over framed stdio IPC, forwards the
//! structured build log to a remote log service, inspects the realised
//! outputs, pushes them to the active binary caches, and reports the
//! terminal status to the CI API.

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod outputs;
pub mod push;
pub mod retry;
pub mod shipper;
pub mod task;
pub mod worker;

pub use agent::Agent;
pub use api::{BuildEvent, BuildTask, CiApi, HttpCiApi, OutputInfo, PushCache};
pub use config::Config;
pub use error::{AgentError, TaskStatus};
