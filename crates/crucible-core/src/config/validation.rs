//! Configuration validation
//!
//! Invalid configuration is the one failure category allowed to surface as
//! an error, and it must do so at startup rather than on the first request.

use super::types::{AuditStorageKind, SandboxConfig};
use crate::errors::SandboxError;

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.backends.is_empty() {
            return Err(SandboxError::ConfigError(
                "at least one isolation backend must be enabled".to_string(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(SandboxError::ConfigError(
                "queue.max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.queue.max_concurrency == 0 {
            return Err(SandboxError::ConfigError(
                "queue.max_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.vm.pool_size == 0 {
            return Err(SandboxError::ConfigError(
                "vm.pool_size must be greater than zero".to_string(),
            ));
        }
        if self.audit.storage == AuditStorageKind::Sqlite && self.audit.path.is_none() {
            return Err(SandboxError::ConfigError(
                "audit.path is required when audit.storage is sqlite".to_string(),
            ));
        }
        if self.audit.capacity == 0 {
            return Err(SandboxError::ConfigError(
                "audit.capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SandboxConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(SandboxConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = SandboxConfig::default();
        config.queue.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_backend_set_is_rejected() {
        let mut config = SandboxConfig::default();
        config.backends.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn sqlite_storage_requires_path() {
        let mut config = SandboxConfig::default();
        config.audit.storage = crate::config::AuditStorageKind::Sqlite;
        assert!(config.validate().is_err());
    }
}
