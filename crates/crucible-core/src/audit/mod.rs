//! Audit trail for sandboxed executions
//!
//! Every execution attempt produces lifecycle events (start, complete,
//! error, resource-limit, security-violation) recorded as immutable,
//! append-only entries. Entries carry a one-way hash of the executed code,
//! never the code itself. Logging is strictly best-effort: storage faults
//! are caught here and logged locally so the execution they describe is
//! never failed or delayed by its own audit trail.

use crate::core_types::{BackendKind, ExecutionMetrics, Language};
use crate::errors::SandboxError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryAuditStorage;
pub use sqlite::SqliteAuditStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    Start,
    Complete,
    Error,
    ResourceLimit,
    SecurityViolation,
}

/// One immutable record per execution lifecycle event.
///
/// This is the only externally visible schema the subsystem owns; changes
/// must stay additive (new optional fields only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub event: AuditEventType,
    pub execution_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub node_id: String,
    pub language: Language,
    pub backend: BackendKind,
    pub code_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// Entry draft before the service assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub event: AuditEventType,
    pub execution_id: String,
    pub user_id: String,
    pub workflow_id: Option<String>,
    pub node_id: String,
    pub language: Language,
    pub backend: BackendKind,
    pub code_hash: String,
    pub metrics: Option<ExecutionMetrics>,
    pub error: Option<String>,
    pub metadata: Value,
}

impl NewAuditEntry {
    fn into_entry(self) -> AuditLogEntry {
        AuditLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            event: self.event,
            execution_id: self.execution_id,
            user_id: self.user_id,
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            language: self.language,
            backend: self.backend,
            code_hash: self.code_hash,
            metrics: self.metrics,
            error: self.error,
            timestamp: Utc::now(),
            metadata: self.metadata,
        }
    }
}

/// Filter set for queries, counts and deletions. All fields are optional
/// and combined conjunctively; results are reverse-chronological with
/// offset/limit pagination.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub execution_id: Option<String>,
    pub user_id: Option<String>,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
    pub event: Option<AuditEventType>,
    pub language: Option<Language>,
    pub backend: Option<BackendKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(execution_id) = &self.execution_id {
            if &entry.execution_id != execution_id {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if &entry.user_id != user_id {
                return false;
            }
        }
        if let Some(workflow_id) = &self.workflow_id {
            if entry.workflow_id.as_ref() != Some(workflow_id) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if &entry.node_id != node_id {
                return false;
            }
        }
        if let Some(event) = self.event {
            if entry.event != event {
                return false;
            }
        }
        if let Some(language) = self.language {
            if entry.language != language {
                return false;
            }
        }
        if let Some(backend) = self.backend {
            if entry.backend != backend {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Pluggable persistence for audit entries. Any durable store implementing
/// these four methods can back the service.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn save(&self, entry: AuditLogEntry) -> Result<(), SandboxError>;
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, SandboxError>;
    async fn count(&self, query: &AuditQuery) -> Result<usize, SandboxError>;
    async fn delete(&self, query: &AuditQuery) -> Result<usize, SandboxError>;
}

/// Aggregate view over recent completions and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub successes: usize,
    pub errors: usize,
    pub by_language: HashMap<String, usize>,
    pub by_backend: HashMap<String, usize>,
    pub average_duration_ms: f64,
}

pub struct AuditService {
    storage: Arc<dyn AuditStorage>,
    enabled: bool,
}

impl AuditService {
    pub fn new(storage: Arc<dyn AuditStorage>, enabled: bool) -> Self {
        Self { storage, enabled }
    }

    /// Assign id and timestamp, persist. Storage failures are logged and
    /// swallowed; the primary execution path must never see them.
    pub async fn log(&self, draft: NewAuditEntry) {
        if !self.enabled {
            return;
        }
        let entry = draft.into_entry();
        if let Err(e) = self.storage.save(entry).await {
            log::warn!("audit entry could not be persisted: {}", e);
        }
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, SandboxError> {
        self.storage.query(query).await
    }

    pub async fn count(&self, query: &AuditQuery) -> Result<usize, SandboxError> {
        self.storage.count(query).await
    }

    pub async fn delete(&self, query: &AuditQuery) -> Result<usize, SandboxError> {
        self.storage.delete(query).await
    }

    /// Aggregate totals, per-language and per-backend breakdowns, and the
    /// average duration across the `window` most recent terminal events.
    pub async fn execution_stats(&self, window: usize) -> Result<ExecutionStats, SandboxError> {
        let recent = self
            .storage
            .query(&AuditQuery {
                limit: Some(window),
                ..Default::default()
            })
            .await?;

        let mut stats = ExecutionStats {
            total: 0,
            successes: 0,
            errors: 0,
            by_language: HashMap::new(),
            by_backend: HashMap::new(),
            average_duration_ms: 0.0,
        };
        let mut duration_sum = 0u64;
        let mut duration_count = 0usize;

        for entry in &recent {
            match entry.event {
                AuditEventType::Complete => stats.successes += 1,
                AuditEventType::Error => stats.errors += 1,
                _ => continue,
            }
            stats.total += 1;
            *stats
                .by_language
                .entry(entry.language.to_string())
                .or_insert(0) += 1;
            *stats
                .by_backend
                .entry(entry.backend.to_string())
                .or_insert(0) += 1;
            if let Some(metrics) = &entry.metrics {
                duration_sum += metrics.duration_ms;
                duration_count += 1;
            }
        }
        if duration_count > 0 {
            stats.average_duration_ms = duration_sum as f64 / duration_count as f64;
        }
        Ok(stats)
    }

    pub async fn security_alerts(&self, limit: usize) -> Result<Vec<AuditLogEntry>, SandboxError> {
        self.storage
            .query(&AuditQuery {
                event: Some(AuditEventType::SecurityViolation),
                limit: Some(limit),
                ..Default::default()
            })
            .await
    }

    pub async fn resource_limit_alerts(
        &self,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, SandboxError> {
        self.storage
            .query(&AuditQuery {
                event: Some(AuditEventType::ResourceLimit),
                limit: Some(limit),
                ..Default::default()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ExecutionMetrics;

    fn draft(event: AuditEventType, user: &str) -> NewAuditEntry {
        NewAuditEntry {
            event,
            execution_id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            workflow_id: None,
            node_id: "node-1".to_string(),
            language: Language::Javascript,
            backend: BackendKind::VmIsolate,
            code_hash: "deadbeef".to_string(),
            metrics: Some(ExecutionMetrics {
                duration_ms: 10,
                ..ExecutionMetrics::instant()
            }),
            error: None,
            metadata: Value::Null,
        }
    }

    /// Storage whose save always fails; the service must swallow it.
    struct FailingStorage;

    #[async_trait]
    impl AuditStorage for FailingStorage {
        async fn save(&self, _entry: AuditLogEntry) -> Result<(), SandboxError> {
            Err(SandboxError::AuditStorageError("disk on fire".to_string()))
        }
        async fn query(&self, _q: &AuditQuery) -> Result<Vec<AuditLogEntry>, SandboxError> {
            Ok(Vec::new())
        }
        async fn count(&self, _q: &AuditQuery) -> Result<usize, SandboxError> {
            Ok(0)
        }
        async fn delete(&self, _q: &AuditQuery) -> Result<usize, SandboxError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn failing_storage_never_propagates() {
        let service = AuditService::new(Arc::new(FailingStorage), true);
        service.log(draft(AuditEventType::Start, "u1")).await;
    }

    #[tokio::test]
    async fn stats_aggregate_terminal_events() {
        let storage = Arc::new(MemoryAuditStorage::new(100));
        let service = AuditService::new(storage, true);
        service.log(draft(AuditEventType::Start, "u1")).await;
        service.log(draft(AuditEventType::Complete, "u1")).await;
        service.log(draft(AuditEventType::Complete, "u2")).await;
        service.log(draft(AuditEventType::Error, "u2")).await;

        let stats = service.execution_stats(100).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.by_language.get("javascript"), Some(&3));
        assert!((stats.average_duration_ms - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn alert_views_filter_by_event() {
        let storage = Arc::new(MemoryAuditStorage::new(100));
        let service = AuditService::new(storage, true);
        service.log(draft(AuditEventType::Complete, "u1")).await;
        service
            .log(draft(AuditEventType::SecurityViolation, "u1"))
            .await;
        service.log(draft(AuditEventType::ResourceLimit, "u2")).await;

        assert_eq!(service.security_alerts(10).await.unwrap().len(), 1);
        assert_eq!(service.resource_limit_alerts(10).await.unwrap().len(), 1);
    }
}
