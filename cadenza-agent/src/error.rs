use thiserror::Error;

use cadenza_protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Nix invocation failed: {0}")]
    Nix(String),

    #[error("Log socket error: {0}")]
    LogSocket(String),
}

impl AgentError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    pub fn nix(message: impl Into<String>) -> Self {
        Self::Nix(message.into())
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

/// Helper trait for adding context to IO errors
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AgentError::io(f(), e))
    }
}

/// Terminal outcome of one build task. Exactly one is produced per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// The build succeeded and outputs were realised (cache distribution
    /// may still have partially failed).
    Successful,
    /// The build itself failed.
    Terminated,
    /// The task died for a reason other than the build failing: protocol
    /// violation, worker crash, timeout, or cancellation.
    Exceptional(String),
}

impl TaskStatus {
    pub fn short_reason(&self) -> &str {
        match self {
            TaskStatus::Successful => "success",
            TaskStatus::Terminated => "build failed",
            TaskStatus::Exceptional(reason) => reason,
        }
    }
}
