//! Core type definitions for the sandboxed execution contract
//!
//! This module defines the data structures exchanged between the workflow
//! orchestrator and the execution subsystem: the per-request context, the
//! resource ceilings, and the uniform result shape every backend produces.
//! The design converts all runtime failure categories into values rather
//! than errors, so callers always receive an `ExecutionResult` and can
//! branch on its `error_code` without catching exceptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Maximum number of captured log lines retained per execution.
pub const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Typescript,
    Python,
    Sql,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::Javascript),
            "typescript" | "ts" => Ok(Language::Typescript),
            "python" | "python3" | "py" => Ok(Language::Python),
            "sql" | "sqlite" => Ok(Language::Sql),
            other => Err(format!("unknown language: {}", other)),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Python => "python",
            Language::Sql => "sql",
        };
        write!(f, "{}", name)
    }
}

/// Identifies which isolation mechanism ran (or would run) an execution.
///
/// `Process` is the degraded direct-process fallback used when the container
/// runtime is unavailable; audit records carry it so reduced-trust runs are
/// distinguishable from properly isolated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    VmIsolate,
    Container,
    Native,
    Process,
}

impl BackendKind {
    /// Kind recorded when a backend serves a request through its
    /// reduced-trust fallback path.
    pub fn degraded_form(self) -> Self {
        match self {
            BackendKind::Container => BackendKind::Process,
            other => other,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::VmIsolate => "vm-isolate",
            BackendKind::Container => "container",
            BackendKind::Native => "native",
            BackendKind::Process => "process",
        };
        write!(f, "{}", name)
    }
}

/// Stable machine-distinguishable failure category.
///
/// Message strings are free-form; downstream consumers that need to branch
/// (e.g. retry on queue overload but not on an execution fault) match on
/// this field instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    UnsupportedLanguage,
    QueueFull,
    QueueWaitTimeout,
    QueueCleared,
    Cancelled,
    Timeout,
    ResourceExceeded,
    SecurityViolation,
    ExecutionFault,
    BackendUnavailable,
    Internal,
}

/// Immutable per-request identity and inputs. Created by the caller, never
/// mutated; lives for exactly one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub node_id: String,
    pub user_id: String,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_modules: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

impl ExecutionContext {
    pub fn new(node_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: None,
            node_id: node_id.into(),
            user_id: user_id.into(),
            inputs: HashMap::new(),
            allowed_modules: None,
            env: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }
}

/// Caller-facing resource ceilings. Every field is optional; unset fields
/// fall through to the per-language defaults and then the deployment
/// defaults when the effective limits are resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_network_connections: Option<u32>,
}

impl ResourceLimits {
    /// Field-wise overlay: values present in `overrides` win.
    pub fn merged_with(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_execution_time_ms: overrides
                .max_execution_time_ms
                .or(self.max_execution_time_ms),
            max_memory_bytes: overrides.max_memory_bytes.or(self.max_memory_bytes),
            max_cpu_time_ms: overrides.max_cpu_time_ms.or(self.max_cpu_time_ms),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
            max_file_size_bytes: overrides.max_file_size_bytes.or(self.max_file_size_bytes),
            max_file_count: overrides.max_file_count.or(self.max_file_count),
            max_network_connections: overrides
                .max_network_connections
                .or(self.max_network_connections),
        }
    }

    /// Resolve to concrete ceilings, filling any still-unset field with the
    /// subsystem hard fallbacks.
    pub fn resolve(&self) -> EffectiveLimits {
        EffectiveLimits {
            max_execution_time_ms: self.max_execution_time_ms.unwrap_or(10_000),
            max_memory_bytes: self.max_memory_bytes.unwrap_or(128 * 1024 * 1024),
            max_cpu_time_ms: self.max_cpu_time_ms,
            max_output_bytes: self.max_output_bytes.unwrap_or(1024 * 1024),
            max_file_size_bytes: self.max_file_size_bytes.unwrap_or(10 * 1024 * 1024),
            max_file_count: self.max_file_count.unwrap_or(16),
            max_network_connections: self.max_network_connections.unwrap_or(0),
        }
    }
}

/// Fully resolved ceilings consumed by backends. No optional fields except
/// CPU time, which only the container backend can enforce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub max_execution_time_ms: u64,
    pub max_memory_bytes: u64,
    pub max_cpu_time_ms: Option<u64>,
    pub max_output_bytes: usize,
    pub max_file_size_bytes: u64,
    pub max_file_count: u32,
    pub max_network_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Classification tag for the raw output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    Undefined,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionMetrics {
    pub fn instant() -> Self {
        let now = Utc::now();
        Self {
            duration_ms: 0,
            memory_bytes: None,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Uniform outcome record for one execution attempt.
///
/// Invariants: `success == false` implies `error` is present and `output`
/// is `Null`; `logs` is capped at [`MAX_LOG_LINES`] in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Value,
    pub formatted_output: String,
    pub output_type: OutputType,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    pub metrics: ExecutionMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: Value, formatted_output: String, output_type: OutputType) -> Self {
        Self {
            success: true,
            output,
            formatted_output,
            output_type,
            logs: Vec::new(),
            metrics: ExecutionMetrics::instant(),
            error: None,
            error_code: None,
            stack: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            formatted_output: String::new(),
            output_type: OutputType::Error,
            logs: Vec::new(),
            metrics: ExecutionMetrics::instant(),
            error: Some(message.into()),
            error_code: Some(code),
            stack: None,
        }
    }

    pub fn with_logs(mut self, mut logs: Vec<LogLine>) -> Self {
        logs.truncate(MAX_LOG_LINES);
        self.logs = logs;
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_aliases_parse() {
        assert_eq!("js".parse::<Language>().unwrap(), Language::Javascript);
        assert_eq!("TS".parse::<Language>().unwrap(), Language::Typescript);
        assert_eq!("python3".parse::<Language>().unwrap(), Language::Python);
        assert!("ruby".parse::<Language>().is_err());
    }

    #[test]
    fn limits_merge_prefers_overrides() {
        let base = ResourceLimits {
            max_memory_bytes: Some(64),
            max_execution_time_ms: Some(1_000),
            ..Default::default()
        };
        let overrides = ResourceLimits {
            max_memory_bytes: Some(16),
            ..Default::default()
        };
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.max_memory_bytes, Some(16));
        assert_eq!(merged.max_execution_time_ms, Some(1_000));
    }

    #[test]
    fn failure_result_upholds_invariant() {
        let result = ExecutionResult::failure(ErrorCode::Timeout, "took too long");
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.output, Value::Null);
        assert_eq!(result.error_code, Some(ErrorCode::Timeout));
    }
}
