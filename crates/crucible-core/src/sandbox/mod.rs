//! Isolation backends for sandboxed code execution
//!
//! Provides the polymorphic contract every isolation mechanism implements,
//! plus the shared tracking layer that wraps concrete executors with audit
//! emission, timing, limit merging and output formatting. Three backends
//! ship with the subsystem: an in-process V8 isolate for JavaScript and
//! TypeScript, a container isolate for Python (and JS/TS as a secondary),
//! and an embedded in-memory SQL engine for data-only transforms.

use crate::core_types::{
    BackendKind, ExecutionContext, ExecutionResult, Language, ResourceLimits,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod container;
pub mod format;
pub mod pool;
pub mod sql;
pub mod tracker;
pub mod typescript;
pub mod vm;

/// Availability and load snapshot for one backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub available: bool,
    /// True when the backend is serving requests through a reduced-trust
    /// fallback path (e.g. direct-process execution without a container).
    pub degraded: bool,
    pub running: usize,
}

/// Contract implemented by every isolation backend.
///
/// `execute` never returns an `Err`: all failure categories, including an
/// unsupported language, resolve to a structured `ExecutionResult` with
/// `success == false`.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn supported_languages(&self) -> &[Language];

    async fn execute(
        &self,
        code: &str,
        language: Language,
        context: &ExecutionContext,
        limits: Option<&ResourceLimits>,
    ) -> ExecutionResult;

    /// Capability probe, memoized where the capability cannot change
    /// within the process lifetime.
    async fn is_available(&self) -> bool;

    /// Best-effort cancellation of an in-flight execution. Terminating an
    /// already-finished or unknown id is a no-op.
    async fn terminate(&self, execution_id: &str);

    async fn status(&self) -> BackendStatus;

    /// Terminate all tracked executions and release held resources.
    async fn cleanup(&self);
}

pub use tracker::ExecutionTracker;
