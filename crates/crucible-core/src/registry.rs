//! Language-to-backend routing
//!
//! Backends are constructed from configuration, probed once, and the
//! language map is frozen at initialization. Each language has a preferred
//! backend kind; when the preferred kind is absent or unavailable the
//! registry falls back to the first configured backend that supports the
//! language, so a host without a container runtime still routes JavaScript
//! somewhere runnable. Requests for languages with no live backend are
//! rejected by the caller with an unsupported-language result.

use crate::audit::AuditService;
use crate::config::{BackendChoice, SandboxConfig};
use crate::core_types::{BackendKind, Language};
use crate::sandbox::container::ContainerBackend;
use crate::sandbox::sql::SqlBackend;
use crate::sandbox::vm::VmIsolateBackend;
use crate::sandbox::{BackendStatus, ExecutionTracker, IsolationBackend};
use std::collections::HashMap;
use std::sync::Arc;

const ALL_LANGUAGES: &[Language] = &[
    Language::Javascript,
    Language::Typescript,
    Language::Python,
    Language::Sql,
];

fn preferred_kind(language: Language) -> BackendKind {
    match language {
        Language::Javascript | Language::Typescript => BackendKind::VmIsolate,
        Language::Python => BackendKind::Container,
        Language::Sql => BackendKind::Native,
    }
}

#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub backends: Vec<BackendStatus>,
    pub languages: HashMap<Language, BackendKind>,
}

pub struct BackendRegistry {
    backends: Vec<Arc<dyn IsolationBackend>>,
    language_map: HashMap<Language, usize>,
}

impl BackendRegistry {
    /// Build every configured backend, probe availability, and freeze the
    /// language routing table.
    pub async fn initialize(
        config: &SandboxConfig,
        audit: Option<Arc<AuditService>>,
    ) -> Self {
        let mut backends: Vec<Arc<dyn IsolationBackend>> = Vec::new();
        for choice in &config.backends {
            let tracker = |kind| {
                ExecutionTracker::new(
                    kind,
                    config.default_limits.clone(),
                    config.language_limits.clone(),
                    audit.clone(),
                )
            };
            match choice {
                BackendChoice::VmIsolate => backends.push(Arc::new(VmIsolateBackend::new(
                    config.vm.clone(),
                    tracker(BackendKind::VmIsolate),
                ))),
                BackendChoice::Container => backends.push(Arc::new(ContainerBackend::new(
                    config.container.clone(),
                    tracker(BackendKind::Container),
                ))),
                BackendChoice::Native => {
                    backends.push(Arc::new(SqlBackend::new(tracker(BackendKind::Native))))
                }
            }
        }
        Self::from_backends(backends).await
    }

    /// Routing over an explicit backend set. Used by tests and embedders
    /// that construct backends themselves.
    pub async fn with_backends(backends: Vec<Arc<dyn IsolationBackend>>) -> Self {
        Self::from_backends(backends).await
    }

    async fn from_backends(backends: Vec<Arc<dyn IsolationBackend>>) -> Self {
        let mut available = Vec::with_capacity(backends.len());
        for backend in &backends {
            available.push(backend.is_available().await);
        }

        let mut language_map = HashMap::new();
        for &language in ALL_LANGUAGES {
            let preferred = preferred_kind(language);
            let chosen = backends
                .iter()
                .enumerate()
                .find(|(i, b)| {
                    b.kind() == preferred
                        && b.supported_languages().contains(&language)
                        && available[*i]
                })
                .or_else(|| {
                    backends.iter().enumerate().find(|(i, b)| {
                        b.supported_languages().contains(&language) && available[*i]
                    })
                });
            match chosen {
                Some((index, backend)) => {
                    if backend.kind() != preferred {
                        log::warn!(
                            "language {} routed to fallback backend {} ({} unavailable)",
                            language,
                            backend.kind(),
                            preferred
                        );
                    } else {
                        log::info!("language {} routed to backend {}", language, backend.kind());
                    }
                    language_map.insert(language, index);
                }
                None => {
                    log::warn!("language {} has no available backend", language);
                }
            }
        }

        Self {
            backends,
            language_map,
        }
    }

    pub fn backend_for_language(&self, language: Language) -> Option<Arc<dyn IsolationBackend>> {
        self.language_map
            .get(&language)
            .map(|&i| self.backends[i].clone())
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.language_map.keys().copied().collect();
        languages.sort_by_key(|l| l.to_string());
        languages
    }

    pub async fn status(&self) -> RegistryStatus {
        let mut statuses = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            statuses.push(backend.status().await);
        }
        let languages = self
            .language_map
            .iter()
            .map(|(&language, &i)| (language, self.backends[i].kind()))
            .collect();
        RegistryStatus {
            backends: statuses,
            languages,
        }
    }

    /// Terminate everything in flight on every backend.
    pub async fn cleanup_all(&self) {
        for backend in &self.backends {
            backend.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{
        ErrorCode, ExecutionContext, ExecutionResult, ResourceLimits,
    };
    use async_trait::async_trait;

    struct FixedBackend {
        kind: BackendKind,
        languages: Vec<Language>,
        available: bool,
    }

    #[async_trait]
    impl IsolationBackend for FixedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn supported_languages(&self) -> &[Language] {
            &self.languages
        }
        async fn execute(
            &self,
            _code: &str,
            _language: Language,
            _context: &ExecutionContext,
            _limits: Option<&ResourceLimits>,
        ) -> ExecutionResult {
            ExecutionResult::failure(ErrorCode::Internal, "not used")
        }
        async fn is_available(&self) -> bool {
            self.available
        }
        async fn terminate(&self, _execution_id: &str) {}
        async fn status(&self) -> BackendStatus {
            BackendStatus {
                kind: self.kind,
                available: self.available,
                degraded: false,
                running: 0,
            }
        }
        async fn cleanup(&self) {}
    }

    #[tokio::test]
    async fn preferred_backends_win_when_available() {
        let registry = BackendRegistry::with_backends(vec![
            Arc::new(FixedBackend {
                kind: BackendKind::VmIsolate,
                languages: vec![Language::Javascript, Language::Typescript],
                available: true,
            }),
            Arc::new(FixedBackend {
                kind: BackendKind::Container,
                languages: vec![Language::Python, Language::Javascript, Language::Typescript],
                available: true,
            }),
            Arc::new(FixedBackend {
                kind: BackendKind::Native,
                languages: vec![Language::Sql],
                available: true,
            }),
        ])
        .await;

        let js = registry.backend_for_language(Language::Javascript).unwrap();
        assert_eq!(js.kind(), BackendKind::VmIsolate);
        let py = registry.backend_for_language(Language::Python).unwrap();
        assert_eq!(py.kind(), BackendKind::Container);
        let sql = registry.backend_for_language(Language::Sql).unwrap();
        assert_eq!(sql.kind(), BackendKind::Native);
    }

    #[tokio::test]
    async fn unavailable_preferred_falls_back_to_any_supporting_backend() {
        let registry = BackendRegistry::with_backends(vec![
            Arc::new(FixedBackend {
                kind: BackendKind::VmIsolate,
                languages: vec![Language::Javascript, Language::Typescript],
                available: false,
            }),
            Arc::new(FixedBackend {
                kind: BackendKind::Container,
                languages: vec![Language::Python, Language::Javascript, Language::Typescript],
                available: true,
            }),
        ])
        .await;

        let js = registry.backend_for_language(Language::Javascript).unwrap();
        assert_eq!(js.kind(), BackendKind::Container);
    }

    #[tokio::test]
    async fn languages_with_no_live_backend_are_unrouted() {
        let registry = BackendRegistry::with_backends(vec![Arc::new(FixedBackend {
            kind: BackendKind::Native,
            languages: vec![Language::Sql],
            available: true,
        })])
        .await;

        assert!(registry.backend_for_language(Language::Python).is_none());
        assert_eq!(registry.supported_languages(), vec![Language::Sql]);
    }

    #[tokio::test]
    async fn status_reports_routing_and_backend_health() {
        let registry = BackendRegistry::with_backends(vec![Arc::new(FixedBackend {
            kind: BackendKind::Native,
            languages: vec![Language::Sql],
            available: true,
        })])
        .await;

        let status = registry.status().await;
        assert_eq!(status.backends.len(), 1);
        assert_eq!(status.languages.get(&Language::Sql), Some(&BackendKind::Native));
    }
}
