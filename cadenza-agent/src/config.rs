use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, IoContext};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the CI API, e.g. `https://ci.example.com`
    pub api_base_url: String,

    /// Bearer token for the CI API
    pub api_token: Option<String>,

    /// Path to the build worker executable.
    ///
    /// When unset, builds fall back to driving `nix-store --realise`
    /// directly instead of supervising a worker subprocess.
    pub worker_path: Option<PathBuf>,

    /// Extra options forwarded verbatim to the worker invocation
    pub extra_nix_options: Vec<String>,

    /// `nix-store` executable used for store queries and realisation
    pub nix_store_bin: PathBuf,

    /// `nix` executable used for derivation metadata and cache copies
    pub nix_bin: PathBuf,

    /// Capacity of the in-process log bus
    pub log_bus_capacity: usize,

    /// Entries per batch shipped to the log socket
    pub log_batch_size: usize,

    /// Concurrent uploads per push cache
    pub cache_push_parallelism: usize,

    /// Wall-clock build timeout in seconds
    pub build_timeout_secs: u64,

    /// Max seconds without worker output before the build is killed
    pub silence_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a worker
    pub kill_grace_secs: u64,

    /// Seconds granted to the log shipper to drain after close
    pub close_grace_secs: u64,

    /// Log level for agent diagnostics
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://ci.example.com".to_string(),
            api_token: None,
            worker_path: None,
            extra_nix_options: Vec::new(),
            nix_store_bin: PathBuf::from("nix-store"),
            nix_bin: PathBuf::from("nix"),
            log_bus_capacity: 1024,
            log_batch_size: 100,
            cache_push_parallelism: 4,
            build_timeout_secs: 10 * 60 * 60,
            silence_timeout_secs: 30 * 60,
            kill_grace_secs: 10,
            close_grace_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_source() {
        let config = Config::default();
        assert_eq!(config.log_bus_capacity, 1024);
        assert_eq!(config.cache_push_parallelism, 4);
        assert_eq!(config.build_timeout(), Duration::from_secs(36_000));
        assert_eq!(config.silence_timeout(), Duration::from_secs(1_800));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            api_base_url = "https://ci.internal"
            cache_push_parallelism = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://ci.internal");
        assert_eq!(config.cache_push_parallelism, 8);
        assert_eq!(config.log_bus_capacity, 1024);
    }
}
