//! Pushes realised store paths to a binary cache.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::api::PushCache;
use crate::outputs::run_tool;
use crate::retry::{CallError, RetryPolicy, with_retry};

/// Result of pushing a path set to one cache.
#[derive(Debug)]
pub struct PushOutcome {
    pub cache: String,
    /// Paths that failed even after retries. Empty means the whole set
    /// made it and a `Pushed` event may be emitted.
    pub failed_paths: Vec<String>,
}

impl PushOutcome {
    pub fn complete(&self) -> bool {
        self.failed_paths.is_empty()
    }
}

pub struct CachePusher {
    nix_bin: PathBuf,
    parallelism: usize,
    policy: RetryPolicy,
}

impl CachePusher {
    pub fn new(nix_bin: impl Into<PathBuf>, parallelism: usize, policy: RetryPolicy) -> Self {
        Self {
            nix_bin: nix_bin.into(),
            parallelism: parallelism.max(1),
            policy,
        }
    }

    /// Push every path to the cache, at most `parallelism` uploads in
    /// flight. Paths already present are skipped by the cache backend; no
    /// deduplication happens here. Individual failures are retried and,
    /// when exhausted, recorded rather than propagated — local
    /// realisation stays authoritative.
    pub async fn push_paths(&self, cache: &PushCache, paths: &[String]) -> PushOutcome {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(paths.len());

        for path in paths {
            let semaphore = Arc::clone(&semaphore);
            let nix_bin = self.nix_bin.clone();
            let policy = self.policy.clone();
            let uri = cache.uri.clone();
            let cache_id = cache.id.clone();
            let path = path.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = with_retry(&policy, "cache push", || {
                    push_one(&nix_bin, &uri, &path)
                })
                .await;
                match result {
                    Ok(()) => {
                        debug!("Pushed {path} to cache {cache_id}");
                        None
                    }
                    Err(e) => {
                        warn!("Giving up pushing {path} to cache {cache_id}: {e}");
                        Some(path)
                    }
                }
            }));
        }

        let mut failed_paths = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(None) => {}
                Ok(Some(path)) => failed_paths.push(path),
                Err(e) => warn!("Push task panicked: {e}"),
            }
        }

        PushOutcome {
            cache: cache.id.clone(),
            failed_paths,
        }
    }
}

async fn push_one(nix_bin: &std::path::Path, uri: &str, path: &str) -> Result<(), CallError> {
    run_tool(
        nix_bin,
        &[
            "--extra-experimental-features",
            "nix-command",
            "copy",
            "--to",
            uri,
            path,
        ],
    )
    .await
    .map(|_| ())
    // Upload failures are assumed transient (network, cache hiccup).
    .map_err(|e| CallError::transient(e.to_string()))
}
