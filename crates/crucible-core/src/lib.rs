//! Sandboxed code execution for workflow engines.
//!
//! This crate runs untrusted user-authored code steps under configurable
//! isolation and returns structured results instead of errors, so a
//! workflow run can branch on failure like any other step outcome.
//!
//! # Architecture Overview
//!
//! The subsystem is organized around several key pieces:
//!
//! - **Isolation backends**: in-process V8 isolates for JavaScript and
//!   TypeScript, hardened containers for Python and JavaScript, and an
//!   embedded in-memory SQL engine
//! - **Execution tracking**: audit emission, limit resolution, timing and
//!   code hashing shared by every backend
//! - **Backend registry**: language routing with availability-aware
//!   fallback, frozen at startup
//! - **Execution queue**: bounded admission with a concurrency ceiling,
//!   priority ordering and deterministic rejection results
//! - **Audit service**: best-effort execution trail over pluggable
//!   in-memory or SQLite storage
//! - **Configuration system**: YAML-backed settings with validated,
//!   environment-appropriate defaults

pub mod audit;
pub mod config;
pub mod core_types;
pub mod errors;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod sandbox;

pub use audit::{AuditLogEntry, AuditQuery, AuditService, AuditStorage};
pub use config::SandboxConfig;
pub use core_types::{
    BackendKind, ErrorCode, ExecutionContext, ExecutionResult, Language, ResourceLimits,
};
pub use errors::SandboxError;
pub use queue::{ExecutionQueue, QueueStats};
pub use registry::BackendRegistry;
pub use runtime::{Sandbox, SandboxStatus};
pub use sandbox::IsolationBackend;

#[cfg(test)]
mod test_sandbox_integration;
