//! Bounded execution queue
//!
//! Admission control in front of the backends: a hard queue-depth cap, a
//! concurrency ceiling, optional priority ordering (stable within a
//! priority level), and a wait deadline for queued work. Every rejection
//! path settles the caller with a deterministic failed result rather than
//! an error type, so workflow engines treat "queue full" exactly like
//! "code threw".
//!
//! A queue-level rejection never reaches a backend, so no audit start
//! event is emitted for it.

use crate::core_types::{
    ErrorCode, ExecutionContext, ExecutionResult, Language, ResourceLimits,
};
use crate::config::QueueConfig;
use crate::registry::BackendRegistry;
use crate::sandbox::IsolationBackend;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const DURATION_WINDOW: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub paused: bool,
    pub total_executed: u64,
    /// Dispatched executions that settled unsuccessfully; always a subset
    /// of `total_executed`.
    pub total_failed: u64,
    /// Tasks that never reached a backend: queue-full, wait-deadline,
    /// cleared, cancelled-while-queued and unroutable submissions.
    pub total_rejected: u64,
    pub average_duration_ms: f64,
}

struct QueuedTask {
    execution_id: String,
    code: String,
    language: Language,
    context: ExecutionContext,
    limits: Option<ResourceLimits>,
    priority: i32,
    reply: oneshot::Sender<ExecutionResult>,
}

struct QueueState {
    queue: VecDeque<QueuedTask>,
    running: HashMap<String, Arc<dyn IsolationBackend>>,
    cancelled: HashSet<String>,
    paused: bool,
    total_executed: u64,
    total_failed: u64,
    total_rejected: u64,
    durations: VecDeque<u64>,
}

impl QueueState {
    fn record_completion(&mut self, success: bool, duration_ms: u64) {
        self.total_executed += 1;
        if !success {
            self.total_failed += 1;
        }
        if self.durations.len() >= DURATION_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(duration_ms);
    }

    fn record_rejection(&mut self) {
        self.total_rejected += 1;
    }
}

struct QueueInner {
    config: QueueConfig,
    registry: Arc<BackendRegistry>,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

impl ExecutionQueue {
    pub fn new(config: QueueConfig, registry: Arc<BackendRegistry>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                registry,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    running: HashMap::new(),
                    cancelled: HashSet::new(),
                    paused: false,
                    total_executed: 0,
                    total_failed: 0,
                    total_rejected: 0,
                    durations: VecDeque::new(),
                }),
            }),
        }
    }

    /// Submit and wait for the result.
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        context: ExecutionContext,
        limits: Option<ResourceLimits>,
        priority: i32,
    ) -> ExecutionResult {
        let rx = self.submit(code, language, context, limits, priority);
        rx.await.unwrap_or_else(|_| {
            ExecutionResult::failure(ErrorCode::Internal, "queue dropped the execution")
        })
    }

    /// Admit a task and return the settlement channel. Admission, priority
    /// placement and the full-queue check all happen synchronously, so
    /// submission order is dispatch order within a priority level.
    pub fn submit(
        &self,
        code: &str,
        language: Language,
        context: ExecutionContext,
        limits: Option<ResourceLimits>,
        priority: i32,
    ) -> oneshot::Receiver<ExecutionResult> {
        let (tx, rx) = oneshot::channel();
        let execution_id = context.execution_id.clone();
        {
            let mut state = self.inner.lock();
            if state.queue.len() >= self.inner.config.max_queue_size {
                state.record_rejection();
                let _ = tx.send(ExecutionResult::failure(
                    ErrorCode::QueueFull,
                    format!(
                        "execution queue is full ({} waiting)",
                        self.inner.config.max_queue_size
                    ),
                ));
                return rx;
            }
            let task = QueuedTask {
                execution_id: execution_id.clone(),
                code: code.to_string(),
                language,
                context,
                limits,
                priority,
                reply: tx,
            };
            if self.inner.config.priority_enabled {
                let pos = state
                    .queue
                    .iter()
                    .position(|t| t.priority < priority)
                    .unwrap_or(state.queue.len());
                state.queue.insert(pos, task);
            } else {
                state.queue.push_back(task);
            }
        }

        self.spawn_wait_deadline(execution_id);
        self.advance();
        rx
    }

    /// Cancel a queued or running execution. Queued tasks settle with a
    /// cancelled result immediately; running ones are terminated through
    /// their backend and their result is rewritten on completion.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let backend = {
            let mut state = self.inner.lock();
            if let Some(pos) = state
                .queue
                .iter()
                .position(|t| t.execution_id == execution_id)
            {
                let task = state.queue.remove(pos);
                state.record_rejection();
                if let Some(task) = task {
                    let _ = task.reply.send(ExecutionResult::failure(
                        ErrorCode::Cancelled,
                        "execution was cancelled while queued",
                    ));
                }
                return true;
            }
            match state.running.get(execution_id) {
                Some(backend) => {
                    let backend = backend.clone();
                    state.cancelled.insert(execution_id.to_string());
                    backend
                }
                None => return false,
            }
        };
        backend.terminate(execution_id).await;
        true
    }

    /// Stop dispatching; queued tasks stay queued and their wait deadlines
    /// keep counting.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        log::info!("execution queue paused");
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
        log::info!("execution queue resumed");
        self.advance();
    }

    /// Drop every queued task, settling each with a cleared result.
    /// In-flight executions are not touched.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueuedTask> = {
            let mut state = self.inner.lock();
            let drained: Vec<QueuedTask> = state.queue.drain(..).collect();
            for _ in &drained {
                state.record_rejection();
            }
            drained
        };
        let count = drained.len();
        for task in drained {
            let _ = task.reply.send(ExecutionResult::failure(
                ErrorCode::QueueCleared,
                "execution queue was cleared",
            ));
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let average_duration_ms = if state.durations.is_empty() {
            0.0
        } else {
            state.durations.iter().sum::<u64>() as f64 / state.durations.len() as f64
        };
        QueueStats {
            queued: state.queue.len(),
            running: state.running.len(),
            paused: state.paused,
            total_executed: state.total_executed,
            total_failed: state.total_failed,
            total_rejected: state.total_rejected,
            average_duration_ms,
        }
    }

    fn spawn_wait_deadline(&self, execution_id: String) {
        let inner = self.inner.clone();
        let wait = Duration::from_millis(inner.config.queue_wait_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let task = {
                let mut state = inner.lock();
                let pos = state
                    .queue
                    .iter()
                    .position(|t| t.execution_id == execution_id);
                match pos {
                    Some(pos) => {
                        state.record_rejection();
                        state.queue.remove(pos)
                    }
                    None => None,
                }
            };
            if let Some(task) = task {
                log::warn!(
                    "execution {} expired after waiting {}ms in queue",
                    task.execution_id,
                    wait.as_millis()
                );
                let _ = task.reply.send(ExecutionResult::failure(
                    ErrorCode::QueueWaitTimeout,
                    format!("execution waited longer than {}ms in queue", wait.as_millis()),
                ));
            }
        });
    }

    /// Dispatch queued tasks while capacity allows.
    fn advance(&self) {
        loop {
            let (task, backend) = {
                let mut state = self.inner.lock();
                if state.paused
                    || state.running.len() >= self.inner.config.max_concurrency
                    || state.queue.is_empty()
                {
                    return;
                }
                let task = match state.queue.pop_front() {
                    Some(task) => task,
                    None => return,
                };
                match self.inner.registry.backend_for_language(task.language) {
                    Some(backend) => {
                        state
                            .running
                            .insert(task.execution_id.clone(), backend.clone());
                        (task, backend)
                    }
                    None => {
                        state.record_rejection();
                        let language = task.language;
                        let _ = task.reply.send(ExecutionResult::failure(
                            ErrorCode::UnsupportedLanguage,
                            format!("no backend is available for {}", language),
                        ));
                        continue;
                    }
                }
            };

            let queue = self.clone();
            tokio::spawn(async move {
                queue.run_task(task, backend).await;
            });
        }
    }

    async fn run_task(&self, task: QueuedTask, backend: Arc<dyn IsolationBackend>) {
        let mut result = backend
            .execute(&task.code, task.language, &task.context, task.limits.as_ref())
            .await;
        {
            let mut state = self.inner.lock();
            state.running.remove(&task.execution_id);
            if state.cancelled.remove(&task.execution_id) {
                let metrics = result.metrics.clone();
                result = ExecutionResult::failure(
                    ErrorCode::Cancelled,
                    "execution was cancelled while running",
                );
                result.metrics = metrics;
            }
            state.record_completion(result.success, result.metrics.duration_ms);
        }
        let _ = task.reply.send(result);
        self.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{BackendKind, OutputType};
    use crate::sandbox::BackendStatus;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records dispatch order and concurrent occupancy; sleeps to hold a
    /// slot so queueing behavior is observable.
    struct ScriptedBackend {
        delay: Duration,
        fail: bool,
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail: false,
                order: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IsolationBackend for ScriptedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Native
        }
        fn supported_languages(&self) -> &[Language] {
            &[Language::Javascript]
        }
        async fn execute(
            &self,
            code: &str,
            _language: Language,
            _context: &ExecutionContext,
            _limits: Option<&ResourceLimits>,
        ) -> ExecutionResult {
            self.order.lock().unwrap().push(code.to_string());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                ExecutionResult::failure(ErrorCode::ExecutionFault, "scripted failure")
            } else {
                ExecutionResult::success(Value::Null, "null".to_string(), OutputType::Null)
            }
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn terminate(&self, _execution_id: &str) {}
        async fn status(&self) -> BackendStatus {
            BackendStatus {
                kind: BackendKind::Native,
                available: true,
                degraded: false,
                running: self.active.load(Ordering::SeqCst),
            }
        }
        async fn cleanup(&self) {}
    }

    async fn queue_with(
        backend: Arc<ScriptedBackend>,
        config: QueueConfig,
    ) -> ExecutionQueue {
        let registry =
            Arc::new(BackendRegistry::with_backends(vec![backend as Arc<dyn IsolationBackend>]).await);
        ExecutionQueue::new(config, registry)
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("node", "user")
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_respected() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(30)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 3,
                max_queue_size: 100,
                ..Default::default()
            },
        )
        .await;

        let mut handles = Vec::new();
        for i in 0..12 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .execute(&format!("task-{}", i), Language::Javascript, context(), None, 0)
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert!(backend.peak.load(Ordering::SeqCst) <= 3);
        let stats = queue.stats();
        assert_eq!(stats.total_executed, 12);
        assert_eq!(stats.total_failed, 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_reaching_the_backend() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(100)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 1,
                max_queue_size: 2,
                ..Default::default()
            },
        )
        .await;

        // One dispatched, two queued, the fourth has nowhere to go.
        let first = queue.submit("run", Language::Javascript, context(), None, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _q1 = queue.submit("q1", Language::Javascript, context(), None, 0);
        let _q2 = queue.submit("q2", Language::Javascript, context(), None, 0);
        let rejected = queue
            .execute("q3", Language::Javascript, context(), None, 0)
            .await;

        assert!(!rejected.success);
        assert_eq!(rejected.error_code, Some(ErrorCode::QueueFull));
        assert!(!backend.order.lock().unwrap().contains(&"q3".to_string()));
        assert!(first.await.unwrap().success);

        // Rejections are counted apart from dispatched work, so failed
        // never exceeds executed.
        let stats = queue.stats();
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.total_failed, 0);
        assert!(stats.total_failed <= stats.total_executed);
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first_and_equal_priority_stays_fifo() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(20)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 1,
                max_queue_size: 100,
                priority_enabled: true,
                ..Default::default()
            },
        )
        .await;

        let blocker = queue.submit("blocker", Language::Javascript, context(), None, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let a = queue.submit("low-a", Language::Javascript, context(), None, 1);
        let b = queue.submit("high", Language::Javascript, context(), None, 5);
        let c = queue.submit("low-b", Language::Javascript, context(), None, 1);

        for rx in [blocker, a, b, c] {
            assert!(rx.await.unwrap().success);
        }
        let order = backend.order.lock().unwrap().clone();
        assert_eq!(order, vec!["blocker", "high", "low-a", "low-b"]);
    }

    #[tokio::test]
    async fn queued_tasks_expire_after_the_wait_deadline() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(200)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 1,
                max_queue_size: 100,
                queue_wait_timeout_ms: 40,
                ..Default::default()
            },
        )
        .await;

        let blocker = queue.submit("blocker", Language::Javascript, context(), None, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = queue
            .execute("waits-too-long", Language::Javascript, context(), None, 0)
            .await;

        assert!(!expired.success);
        assert_eq!(expired.error_code, Some(ErrorCode::QueueWaitTimeout));
        assert!(!backend
            .order
            .lock()
            .unwrap()
            .contains(&"waits-too-long".to_string()));
        assert!(blocker.await.unwrap().success);
    }

    #[tokio::test]
    async fn cancel_settles_queued_tasks_with_cancelled() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(100)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 1,
                max_queue_size: 100,
                ..Default::default()
            },
        )
        .await;

        let _blocker = queue.submit("blocker", Language::Javascript, context(), None, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let victim = context();
        let victim_id = victim.execution_id.clone();
        let rx = queue.submit("victim", Language::Javascript, victim, None, 0);

        assert!(queue.cancel(&victim_id).await);
        let result = rx.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::Cancelled));
        assert!(!queue.cancel("no-such-id").await);
    }

    #[tokio::test]
    async fn pause_holds_dispatch_and_resume_releases_it() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(5)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 2,
                max_queue_size: 100,
                ..Default::default()
            },
        )
        .await;

        queue.pause();
        let rx = queue.submit("held", Language::Javascript, context(), None, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.order.lock().unwrap().is_empty());
        assert!(queue.stats().paused);

        queue.resume();
        assert!(rx.await.unwrap().success);
    }

    #[tokio::test]
    async fn clear_settles_everything_still_queued() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(100)));
        let queue = queue_with(
            backend.clone(),
            QueueConfig {
                max_concurrency: 1,
                max_queue_size: 100,
                ..Default::default()
            },
        )
        .await;

        let _blocker = queue.submit("blocker", Language::Javascript, context(), None, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let rx1 = queue.submit("one", Language::Javascript, context(), None, 0);
        let rx2 = queue.submit("two", Language::Javascript, context(), None, 0);

        assert_eq!(queue.clear(), 2);
        for rx in [rx1, rx2] {
            let result = rx.await.unwrap();
            assert_eq!(result.error_code, Some(ErrorCode::QueueCleared));
        }
    }

    #[tokio::test]
    async fn unroutable_language_settles_without_dispatch() {
        let backend = Arc::new(ScriptedBackend::new(Duration::from_millis(5)));
        let queue = queue_with(backend.clone(), QueueConfig::default()).await;

        let result = queue
            .execute("SELECT 1", Language::Sql, context(), None, 0)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::UnsupportedLanguage));
        assert!(backend.order.lock().unwrap().is_empty());
    }
}
