//! Error types for construct-time failures
//!
//! Steady-state request handling never surfaces these: runtime failure
//! categories (unsupported language, queue overload, timeouts, faults in
//! the sandboxed code) are all converted to `ExecutionResult` values at
//! the lowest feasible layer. `SandboxError` exists for the cases that
//! should fail fast during startup, such as invalid configuration or a
//! storage path that cannot be opened.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Audit storage error: {0}")]
    AuditStorageError(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_yaml::Error> for SandboxError {
    fn from(err: serde_yaml::Error) -> Self {
        SandboxError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::SerializationError(err.to_string())
    }
}
