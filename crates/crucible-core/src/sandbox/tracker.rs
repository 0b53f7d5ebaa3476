//! Shared execution tracking layered over every backend
//!
//! Concrete executors only know how to run code; everything cross-cutting
//! lives here: audit event emission (start, then exactly one of complete or
//! error), the three-layer resource-limit merge, wall-clock timing, the
//! timeout race helper, and code hashing for traceability. The raw snippet
//! is never persisted; only its SHA-256 digest reaches the audit trail.

use crate::audit::{AuditEventType, AuditService, NewAuditEntry};
use crate::core_types::{
    BackendKind, EffectiveLimits, ErrorCode, ExecutionContext, ExecutionMetrics, ExecutionResult,
    Language, ResourceLimits,
};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Best-effort cancellation hook registered by a backend for one in-flight
/// execution. Invoked at most once.
pub type CancelFn = Box<dyn Fn() + Send + Sync + 'static>;

pub struct ExecutionTracker {
    backend: BackendKind,
    defaults: ResourceLimits,
    language_limits: HashMap<Language, ResourceLimits>,
    audit: Option<Arc<AuditService>>,
    running: Mutex<HashMap<String, CancelFn>>,
}

impl ExecutionTracker {
    pub fn new(
        backend: BackendKind,
        defaults: ResourceLimits,
        language_limits: HashMap<Language, ResourceLimits>,
        audit: Option<Arc<AuditService>>,
    ) -> Self {
        Self {
            backend,
            defaults,
            language_limits,
            audit,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Deployment defaults < language defaults < caller overrides.
    pub fn effective_limits(
        &self,
        language: Language,
        overrides: Option<&ResourceLimits>,
    ) -> EffectiveLimits {
        let mut merged = match self.language_limits.get(&language) {
            Some(bias) => self.defaults.merged_with(bias),
            None => self.defaults.clone(),
        };
        if let Some(overrides) = overrides {
            merged = merged.merged_with(overrides);
        }
        merged.resolve()
    }

    pub fn code_hash(code: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Register a cancellation hook for an in-flight execution.
    pub fn track(&self, execution_id: &str, cancel: CancelFn) {
        let mut running = self.lock_running();
        running.insert(execution_id.to_string(), cancel);
    }

    /// Fire the cancellation hook if one is registered. The tracking entry
    /// is removed regardless of whether the backend confirms cancellation,
    /// so the map cannot leak entries for wedged executions.
    pub fn terminate(&self, execution_id: &str) {
        let cancel = {
            let mut running = self.lock_running();
            running.remove(execution_id)
        };
        if let Some(cancel) = cancel {
            log::debug!("terminating execution {}", execution_id);
            cancel();
        }
    }

    pub fn terminate_all(&self) {
        let hooks: Vec<(String, CancelFn)> = {
            let mut running = self.lock_running();
            running.drain().collect()
        };
        for (id, cancel) in hooks {
            log::debug!("terminating execution {} during cleanup", id);
            cancel();
        }
    }

    pub fn running_count(&self) -> usize {
        self.lock_running().len()
    }

    /// Wrap a concrete execution: emit the `start` audit event, time the
    /// run, emit `complete` or `error` (never both), and always drop the
    /// cancellation tracking entry afterwards.
    pub async fn run<F, Fut>(
        &self,
        code: &str,
        language: Language,
        context: &ExecutionContext,
        overrides: Option<&ResourceLimits>,
        degraded: bool,
        f: F,
    ) -> ExecutionResult
    where
        F: FnOnce(EffectiveLimits) -> Fut,
        Fut: Future<Output = ExecutionResult>,
    {
        let limits = self.effective_limits(language, overrides);
        let code_hash = Self::code_hash(code);
        let (backend, metadata) = if degraded {
            (
                self.backend.degraded_form(),
                serde_json::json!({ "degraded": true }),
            )
        } else {
            (self.backend, Value::Null)
        };

        self.emit(
            backend,
            AuditEventType::Start,
            context,
            language,
            &code_hash,
            None,
            None,
            metadata.clone(),
        )
        .await;

        let started_at = Utc::now();
        let started = Instant::now();
        let mut result = f(limits).await;
        let finished_at = Utc::now();

        result.metrics.duration_ms = started.elapsed().as_millis() as u64;
        result.metrics.started_at = started_at;
        result.metrics.finished_at = finished_at;

        if result.success {
            self.emit(
                backend,
                AuditEventType::Complete,
                context,
                language,
                &code_hash,
                Some(result.metrics.clone()),
                None,
                metadata,
            )
            .await;
        } else {
            if matches!(
                result.error_code,
                Some(ErrorCode::ResourceExceeded) | Some(ErrorCode::Timeout)
            ) {
                self.emit(
                    backend,
                    AuditEventType::ResourceLimit,
                    context,
                    language,
                    &code_hash,
                    Some(result.metrics.clone()),
                    result.error.clone(),
                    metadata.clone(),
                )
                .await;
            }
            if result.error_code == Some(ErrorCode::SecurityViolation) {
                self.emit(
                    backend,
                    AuditEventType::SecurityViolation,
                    context,
                    language,
                    &code_hash,
                    Some(result.metrics.clone()),
                    result.error.clone(),
                    metadata.clone(),
                )
                .await;
            }
            self.emit(
                backend,
                AuditEventType::Error,
                context,
                language,
                &code_hash,
                Some(result.metrics.clone()),
                result.error.clone(),
                metadata,
            )
            .await;
        }

        // Untrack unconditionally; terminate() may already have done so.
        let mut running = self.lock_running();
        running.remove(&context.execution_id);
        result
    }

    /// Race a future against the execution-time ceiling.
    pub async fn with_deadline<Fut>(&self, limit_ms: u64, fut: Fut) -> ExecutionResult
    where
        Fut: Future<Output = ExecutionResult>,
    {
        match tokio::time::timeout(Duration::from_millis(limit_ms), fut).await {
            Ok(result) => result,
            Err(_) => ExecutionResult::failure(
                ErrorCode::Timeout,
                format!("execution exceeded the {}ms time limit", limit_ms),
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        backend: BackendKind,
        event: AuditEventType,
        context: &ExecutionContext,
        language: Language,
        code_hash: &str,
        metrics: Option<ExecutionMetrics>,
        error: Option<String>,
        metadata: Value,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        audit
            .log(NewAuditEntry {
                event,
                execution_id: context.execution_id.clone(),
                user_id: context.user_id.clone(),
                workflow_id: context.workflow_id.clone(),
                node_id: context.node_id.clone(),
                language,
                backend,
                code_hash: code_hash.to_string(),
                metrics,
                error,
                metadata,
            })
            .await;
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelFn>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, MemoryAuditStorage};
    use crate::core_types::OutputType;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tracker_with_audit() -> (ExecutionTracker, Arc<AuditService>) {
        let audit = Arc::new(AuditService::new(
            Arc::new(MemoryAuditStorage::new(100)),
            true,
        ));
        let language_limits = HashMap::from([(
            Language::Sql,
            ResourceLimits {
                max_memory_bytes: Some(256),
                ..Default::default()
            },
        )]);
        let defaults = ResourceLimits {
            max_memory_bytes: Some(64),
            max_execution_time_ms: Some(5_000),
            ..Default::default()
        };
        (
            ExecutionTracker::new(
                BackendKind::Native,
                defaults,
                language_limits,
                Some(audit.clone()),
            ),
            audit,
        )
    }

    #[test]
    fn merge_layers_resolve_in_order() {
        let (tracker, _) = tracker_with_audit();
        // No override: language default wins over deployment default.
        let limits = tracker.effective_limits(Language::Sql, None);
        assert_eq!(limits.max_memory_bytes, 256);
        // Caller override wins over everything.
        let overrides = ResourceLimits {
            max_memory_bytes: Some(16),
            ..Default::default()
        };
        let limits = tracker.effective_limits(Language::Sql, Some(&overrides));
        assert_eq!(limits.max_memory_bytes, 16);
        // Unknown language falls back to deployment defaults.
        let limits = tracker.effective_limits(Language::Python, None);
        assert_eq!(limits.max_memory_bytes, 64);
    }

    #[test]
    fn code_hash_is_stable_and_one_way() {
        let a = ExecutionTracker::code_hash("SELECT 1");
        let b = ExecutionTracker::code_hash("SELECT 1");
        let c = ExecutionTracker::code_hash("SELECT 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(!a.contains("SELECT"));
    }

    #[tokio::test]
    async fn run_emits_start_then_complete() {
        let (tracker, audit) = tracker_with_audit();
        let context = ExecutionContext::new("node", "user");
        let result = tracker
            .run("1 + 1", Language::Javascript, &context, None, false, |_| async {
                ExecutionResult::success(serde_json::json!(2), "2".to_string(), OutputType::Number)
            })
            .await;
        assert!(result.success);

        let entries = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Reverse chronological: complete first, start last.
        assert_eq!(entries[0].event, AuditEventType::Complete);
        assert_eq!(entries[1].event, AuditEventType::Start);
        assert_eq!(entries[0].code_hash, ExecutionTracker::code_hash("1 + 1"));
    }

    #[tokio::test]
    async fn timeout_failure_emits_resource_limit_event() {
        let (tracker, audit) = tracker_with_audit();
        let context = ExecutionContext::new("node", "user");
        let result = tracker
            .run("while(1){}", Language::Javascript, &context, None, false, |_| async {
                ExecutionResult::failure(ErrorCode::Timeout, "execution exceeded the 10ms time limit")
            })
            .await;
        assert!(!result.success);

        let limit_events = audit
            .query(&AuditQuery {
                event: Some(AuditEventType::ResourceLimit),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limit_events.len(), 1);
        let error_events = audit
            .query(&AuditQuery {
                event: Some(AuditEventType::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(error_events.len(), 1);
    }

    #[tokio::test]
    async fn policy_rejection_emits_security_violation_event() {
        let (tracker, audit) = tracker_with_audit();
        let context = ExecutionContext::new("node", "user");
        let result = tracker
            .run("import os", Language::Python, &context, None, false, |_| async {
                ExecutionResult::failure(
                    ErrorCode::SecurityViolation,
                    "module 'os' is not in the allow-list",
                )
            })
            .await;
        assert!(!result.success);

        let alerts = audit.security_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event, AuditEventType::SecurityViolation);
        assert!(alerts[0].error.as_deref().unwrap().contains("allow-list"));
        // The terminal error event is still emitted exactly once.
        let errors = audit
            .query(&AuditQuery {
                event: Some(AuditEventType::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn degraded_runs_are_recorded_under_the_fallback_kind() {
        let audit = Arc::new(AuditService::new(
            Arc::new(MemoryAuditStorage::new(100)),
            true,
        ));
        let tracker = ExecutionTracker::new(
            BackendKind::Container,
            ResourceLimits::default(),
            HashMap::new(),
            Some(audit.clone()),
        );
        let context = ExecutionContext::new("node", "user");
        tracker
            .run("x = 1", Language::Python, &context, None, true, |_| async {
                ExecutionResult::success(Value::Null, "null".to_string(), OutputType::Null)
            })
            .await;

        let entries = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert_eq!(entry.backend, BackendKind::Process);
            assert_eq!(entry.metadata["degraded"], true);
        }
    }

    #[tokio::test]
    async fn terminate_fires_hook_once_and_untracks() {
        let (tracker, _) = tracker_with_audit();
        let fired = Arc::new(AtomicBool::new(false));
        let hook_fired = fired.clone();
        tracker.track(
            "exec-1",
            Box::new(move || {
                hook_fired.store(true, Ordering::SeqCst);
            }),
        );
        assert_eq!(tracker.running_count(), 1);
        tracker.terminate("exec-1");
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(tracker.running_count(), 0);
        // Terminating an unknown id is a no-op.
        tracker.terminate("exec-1");
    }

    #[tokio::test]
    async fn deadline_race_returns_timeout_result() {
        let (tracker, _) = tracker_with_audit();
        let result = tracker
            .with_deadline(20, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ExecutionResult::success(Value::Null, String::new(), OutputType::Null)
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::Timeout));
    }
}
