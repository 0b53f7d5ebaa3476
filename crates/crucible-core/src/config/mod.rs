//! Configuration module for the sandboxed execution subsystem
//!
//! Deployment-level options are expressed as a YAML-loadable config with
//! sensible defaults for every field, so a minimal deployment needs no
//! file at all. The layered resource-limit model (deployment defaults,
//! per-language bias, caller overrides) starts here: this module owns the
//! first two layers.

pub mod types;
pub mod validation;

pub use types::*;

use crate::errors::SandboxError;
use std::path::Path;

/// Load a sandbox configuration from a YAML file.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
    let raw = tokio::fs::read_to_string(path.as_ref()).await?;
    let config: SandboxConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
