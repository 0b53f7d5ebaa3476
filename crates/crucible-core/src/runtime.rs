//! Sandbox composition root
//!
//! Wires configuration, audit storage, the backend registry and the
//! execution queue into one handle. Embedders construct a `Sandbox` once
//! at startup and push every code step through `execute`.

use crate::audit::{AuditService, AuditStorage, MemoryAuditStorage, SqliteAuditStorage};
use crate::config::{load_config, AuditStorageKind, SandboxConfig};
use crate::core_types::{ExecutionContext, ExecutionResult, Language, ResourceLimits};
use crate::errors::SandboxError;
use crate::queue::{ExecutionQueue, QueueStats};
use crate::registry::{BackendRegistry, RegistryStatus};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SandboxStatus {
    pub registry: RegistryStatus,
    pub queue: QueueStats,
}

pub struct Sandbox {
    audit: Option<Arc<AuditService>>,
    registry: Arc<BackendRegistry>,
    queue: ExecutionQueue,
}

impl Sandbox {
    pub async fn initialize(config: SandboxConfig) -> Result<Self, SandboxError> {
        config.validate()?;

        let audit = if config.audit.enabled {
            let storage: Arc<dyn AuditStorage> = match config.audit.storage {
                AuditStorageKind::Memory => {
                    Arc::new(MemoryAuditStorage::new(config.audit.capacity))
                }
                AuditStorageKind::Sqlite => {
                    let path = config.audit.path.as_ref().ok_or_else(|| {
                        SandboxError::ConfigError(
                            "sqlite audit storage requires a path".to_string(),
                        )
                    })?;
                    Arc::new(SqliteAuditStorage::open(path))
                }
            };
            Some(Arc::new(AuditService::new(storage, true)))
        } else {
            None
        };

        let registry = Arc::new(BackendRegistry::initialize(&config, audit.clone()).await);
        let queue = ExecutionQueue::new(config.queue.clone(), registry.clone());
        log::info!(
            "sandbox initialized with {} backend(s), audit {}",
            config.backends.len(),
            if audit.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            audit,
            registry,
            queue,
        })
    }

    pub async fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self, SandboxError> {
        let config = load_config(path).await?;
        Self::initialize(config).await
    }

    /// Run one code step through admission control and its routed backend.
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        context: ExecutionContext,
        limits: Option<ResourceLimits>,
        priority: i32,
    ) -> ExecutionResult {
        self.queue.execute(code, language, context, limits, priority).await
    }

    pub async fn cancel(&self, execution_id: &str) -> bool {
        self.queue.cancel(execution_id).await
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> Option<&Arc<AuditService>> {
        self.audit.as_ref()
    }

    pub async fn status(&self) -> SandboxStatus {
        SandboxStatus {
            registry: self.registry.status().await,
            queue: self.queue.stats(),
        }
    }

    /// Drop queued work and terminate everything in flight.
    pub async fn shutdown(&self) {
        let cleared = self.queue.clear();
        if cleared > 0 {
            log::info!("cleared {} queued execution(s) during shutdown", cleared);
        }
        self.registry.cleanup_all().await;
    }
}
