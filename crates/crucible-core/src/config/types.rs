//! Configuration type definitions for the execution subsystem
//!
//! Every field carries a serde default so configs can be partial. The
//! per-language limit table biases ceilings by workload shape: SQL data
//! transforms get a longer timeout and a larger memory ceiling than the
//! scripting languages, which are expected to finish quickly.

use crate::core_types::{Language, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Which isolation backends a deployment enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendChoice {
    VmIsolate,
    Container,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendChoice>,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default = "default_limits")]
    pub default_limits: ResourceLimits,
    #[serde(default = "default_language_limits")]
    pub language_limits: HashMap<Language, ResourceLimits>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            container: ContainerConfig::default(),
            vm: VmConfig::default(),
            default_limits: default_limits(),
            language_limits: default_language_limits(),
            queue: QueueConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Deployment defaults overlaid with the per-language bias. The third
    /// layer (caller overrides) is applied by the execution tracker.
    pub fn limits_for_language(&self, language: Language) -> ResourceLimits {
        match self.language_limits.get(&language) {
            Some(bias) => self.default_limits.merged_with(bias),
            None => self.default_limits.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_python_image")]
    pub python_image: String,
    #[serde(default = "default_node_image")]
    pub node_image: String,
    /// Docker network mode for sandbox containers. `none` unless the
    /// deployment explicitly opts in to networked steps.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default = "default_tmpfs_bytes")]
    pub tmpfs_bytes: u64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            python_image: default_python_image(),
            node_image: default_node_image(),
            network_mode: default_network_mode(),
            tmpfs_bytes: default_tmpfs_bytes(),
            pids_limit: default_pids_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Number of dedicated isolate worker threads kept alive.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// V8 heap cap per isolate, in bytes.
    #[serde(default = "default_heap_bytes")]
    pub max_heap_bytes: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_heap_bytes: default_heap_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_queue_wait_timeout_ms")]
    pub queue_wait_timeout_ms: u64,
    #[serde(default = "default_priority_enabled")]
    pub priority_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrency: default_max_concurrency(),
            queue_wait_timeout_ms: default_queue_wait_timeout_ms(),
            priority_enabled: default_priority_enabled(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStorageKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_audit_storage")]
    pub storage: AuditStorageKind,
    /// Database path for the sqlite storage kind.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Ring-buffer capacity for the memory storage kind.
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            storage: default_audit_storage(),
            path: None,
            capacity: default_audit_capacity(),
        }
    }
}

fn default_backends() -> Vec<BackendChoice> {
    vec![
        BackendChoice::VmIsolate,
        BackendChoice::Container,
        BackendChoice::Native,
    ]
}

fn default_python_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_node_image() -> String {
    "node:20-slim".to_string()
}

fn default_network_mode() -> String {
    "none".to_string()
}

fn default_tmpfs_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_pids_limit() -> i64 {
    64
}

fn default_pool_size() -> usize {
    4
}

fn default_heap_bytes() -> usize {
    128 * 1024 * 1024
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    4
}

fn default_queue_wait_timeout_ms() -> u64 {
    30_000
}

fn default_priority_enabled() -> bool {
    true
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_storage() -> AuditStorageKind {
    AuditStorageKind::Memory
}

fn default_audit_capacity() -> usize {
    10_000
}

fn default_limits() -> ResourceLimits {
    ResourceLimits {
        max_execution_time_ms: Some(10_000),
        max_memory_bytes: Some(128 * 1024 * 1024),
        max_cpu_time_ms: None,
        max_output_bytes: Some(1024 * 1024),
        max_file_size_bytes: Some(10 * 1024 * 1024),
        max_file_count: Some(16),
        max_network_connections: Some(0),
    }
}

fn default_language_limits() -> HashMap<Language, ResourceLimits> {
    let mut limits = HashMap::new();
    limits.insert(
        Language::Sql,
        ResourceLimits {
            max_execution_time_ms: Some(30_000),
            max_memory_bytes: Some(256 * 1024 * 1024),
            ..Default::default()
        },
    );
    limits.insert(
        Language::Python,
        ResourceLimits {
            max_execution_time_ms: Some(15_000),
            ..Default::default()
        },
    );
    limits
}
