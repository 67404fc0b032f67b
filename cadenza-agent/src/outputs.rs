//! Queries derivation outputs and their on-disk metadata from Nix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use cadenza_protocol::ProtocolError;

use crate::api::OutputInfo;
use crate::error::AgentError;

/// `nix derivation show` JSON: one entry per output name.
#[derive(Deserialize)]
struct DrvOutputJson {
    path: String,
}

#[derive(Deserialize)]
struct DrvJson {
    outputs: BTreeMap<String, DrvOutputJson>,
}

pub struct OutputInspector {
    nix_bin: PathBuf,
    nix_store_bin: PathBuf,
}

impl OutputInspector {
    pub fn new(nix_bin: impl Into<PathBuf>, nix_store_bin: impl Into<PathBuf>) -> Self {
        Self {
            nix_bin: nix_bin.into(),
            nix_store_bin: nix_store_bin.into(),
        }
    }

    /// Resolve every declared output of `drv_path` to its realised
    /// metadata. Returns one entry per declared output, keyed by output
    /// name, or fails atomically.
    pub async fn query_outputs(
        &self,
        drv_path: &str,
    ) -> Result<BTreeMap<String, OutputInfo>, AgentError> {
        let declared = self.declared_outputs(drv_path).await?;

        let mut result = BTreeMap::new();
        for (name, path) in declared {
            let size = self.query_size(&path).await?;
            let hash = self.query_hash(&path).await?;
            debug!("Output {name} at {path}: {size} bytes, {hash}");
            result.insert(
                name.clone(),
                OutputInfo {
                    deriver: drv_path.to_string(),
                    name,
                    path,
                    hash,
                    size,
                },
            );
        }
        Ok(result)
    }

    /// Declared outputs of the derivation: name → store path.
    async fn declared_outputs(
        &self,
        drv_path: &str,
    ) -> Result<BTreeMap<String, String>, AgentError> {
        let stdout = run_tool(
            &self.nix_bin,
            &[
                "--extra-experimental-features",
                "nix-command",
                "derivation",
                "show",
                drv_path,
            ],
        )
        .await?;

        // Top-level object is keyed by the derivation path.
        let parsed: BTreeMap<String, DrvJson> = serde_json::from_str(&stdout).map_err(|e| {
            ProtocolError::malformed(format!("derivation show output for {drv_path}: {e}"))
        })?;
        let drv = parsed.into_values().next().ok_or_else(|| {
            ProtocolError::malformed(format!("derivation show returned nothing for {drv_path}"))
        })?;

        Ok(drv
            .outputs
            .into_iter()
            .map(|(name, output)| (name, output.path))
            .collect())
    }

    async fn query_size(&self, path: &str) -> Result<u64, AgentError> {
        let stdout = run_tool(&self.nix_store_bin, &["--query", "--size", path]).await?;
        let trimmed = stdout.trim();
        let size: u64 = trimmed.parse().map_err(|_| {
            ProtocolError::malformed(format!("nix-store --query --size for {path}: {trimmed:?}"))
        })?;
        Ok(size)
    }

    async fn query_hash(&self, path: &str) -> Result<String, AgentError> {
        let stdout = run_tool(&self.nix_store_bin, &["--query", "--hash", path]).await?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::malformed(format!(
                "nix-store --query --hash for {path} returned nothing"
            ))
            .into());
        }
        Ok(trimmed.to_string())
    }
}

/// Run a Nix tool to completion and return its stdout as UTF-8.
pub(crate) async fn run_tool(bin: &Path, args: &[&str]) -> Result<String, AgentError> {
    let output = tokio::process::Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|e| AgentError::nix(format!("failed to run {}: {e}", bin.display())))?;

    if !output.status.success() {
        return Err(AgentError::nix(format!(
            "{} {} failed with {}: {}",
            bin.display(),
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| AgentError::nix(format!("{} produced non-UTF-8 output: {e}", bin.display())))
}
