//! In-process V8 isolate backend
//!
//! The lowest-latency backend: JavaScript and TypeScript run inside a
//! fresh V8 isolate per execution, with no filesystem, network, process or
//! import surface at all. The bootstrap removes `Deno`, `eval` and the
//! code-generation constructors before user code runs, installs a frozen
//! capturing `console`, and binds the step inputs as a global. A
//! near-heap-limit callback turns V8 OOM aborts into terminations, and a
//! CPU watchdog thread terminates tight synchronous loops the event-loop
//! timeout cannot reach.
//!
//! TypeScript is handled by stripping type annotations; no type checking
//! happens here.

use crate::config::VmConfig;
use crate::core_types::{
    BackendKind, ErrorCode, ExecutionContext, ExecutionResult, Language, LogLevel, LogLine,
    OutputType, ResourceLimits, MAX_LOG_LINES,
};
use crate::sandbox::format::{format_value, output_type_of, FormatOptions};
use crate::sandbox::pool::IsolatePool;
use crate::sandbox::typescript::strip_types;
use crate::sandbox::{BackendStatus, ExecutionTracker, IsolationBackend};
use async_trait::async_trait;
use deno_core::{v8, JsRuntime, ModuleCodeString, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

static SUPPORTED: &[Language] = &[Language::Javascript, Language::Typescript];

/// Everything one isolate run needs, shipped to a pool worker thread.
pub(crate) struct IsolatePayload {
    pub code: String,
    pub inputs: Value,
    pub heap_bytes: usize,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
    /// Filled with the isolate handle once the runtime exists, so an
    /// external terminate can reach a run already in progress.
    pub isolate_slot: Arc<Mutex<Option<v8::IsolateHandle>>>,
}

pub struct VmIsolateBackend {
    tracker: Arc<ExecutionTracker>,
    pool: IsolatePool,
    max_heap_bytes: usize,
    availability: OnceCell<bool>,
}

impl VmIsolateBackend {
    pub fn new(config: VmConfig, tracker: ExecutionTracker) -> Self {
        Self {
            tracker: Arc::new(tracker),
            pool: IsolatePool::new(config.pool_size),
            max_heap_bytes: config.max_heap_bytes,
            availability: OnceCell::new(),
        }
    }

    /// One-time smoke test: run a trivial script through the whole worker
    /// and extraction path. Memoized for the life of the backend.
    async fn probe(&self) -> bool {
        *self
            .availability
            .get_or_init(|| async {
                if self.pool.size() == 0 {
                    return false;
                }
                let payload = IsolatePayload {
                    code: "return 1;".to_string(),
                    inputs: Value::Object(serde_json::Map::new()),
                    heap_bytes: 32 * 1024 * 1024,
                    timeout_ms: 5_000,
                    max_output_bytes: 1024,
                    isolate_slot: Arc::new(Mutex::new(None)),
                };
                let ok = self.pool.run(payload).await.success;
                if !ok {
                    log::warn!("v8 isolate probe failed; vm backend reports unavailable");
                }
                ok
            })
            .await
    }
}

#[async_trait]
impl IsolationBackend for VmIsolateBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VmIsolate
    }

    fn supported_languages(&self) -> &[Language] {
        SUPPORTED
    }

    async fn execute(
        &self,
        code: &str,
        language: Language,
        context: &ExecutionContext,
        limits: Option<&ResourceLimits>,
    ) -> ExecutionResult {
        if !SUPPORTED.contains(&language) {
            return ExecutionResult::failure(
                ErrorCode::UnsupportedLanguage,
                format!("vm isolate backend cannot execute {}", language),
            );
        }

        let js = match language {
            Language::Typescript => strip_types(code),
            _ => code.to_string(),
        };
        let inputs = match serde_json::to_value(&context.inputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorCode::Internal,
                    format!("could not serialize inputs: {}", e),
                )
            }
        };

        self.tracker
            .run(code, language, context, limits, false, move |limits| async move {
                let isolate_slot = Arc::new(Mutex::new(None::<v8::IsolateHandle>));
                let hook_slot = isolate_slot.clone();
                self.tracker.track(
                    &context.execution_id,
                    Box::new(move || {
                        if let Ok(slot) = hook_slot.lock() {
                            if let Some(handle) = slot.as_ref() {
                                handle.terminate_execution();
                            }
                        }
                    }),
                );

                // The configured per-isolate cap bounds whatever the
                // limit merge produced.
                let heap_bytes =
                    (limits.max_memory_bytes as usize).min(self.max_heap_bytes);
                self.pool
                    .run(IsolatePayload {
                        code: js,
                        inputs,
                        heap_bytes,
                        timeout_ms: limits.max_execution_time_ms,
                        max_output_bytes: limits.max_output_bytes,
                        isolate_slot,
                    })
                    .await
            })
            .await
    }

    async fn is_available(&self) -> bool {
        self.probe().await
    }

    async fn terminate(&self, execution_id: &str) {
        self.tracker.terminate(execution_id);
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            kind: BackendKind::VmIsolate,
            available: self.is_available().await,
            degraded: false,
            running: self.tracker.running_count(),
        }
    }

    async fn cleanup(&self) {
        self.tracker.terminate_all();
    }
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution as the heap approaches its cap, granting 1MB of
/// grace so the termination exception can propagate instead of V8
/// aborting the process.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the HeapLimitState boxed in
    // execute_in_isolate, which outlives the runtime and the watchdog.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

#[derive(Deserialize)]
struct IsolateEnvelope {
    outcome: Option<Outcome>,
    #[serde(default)]
    logs: Vec<EnvelopeLog>,
}

#[derive(Deserialize)]
struct Outcome {
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    undef: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stack: Option<String>,
}

#[derive(Deserialize)]
struct EnvelopeLog {
    level: LogLevel,
    message: String,
}

/// Runs on a pool worker thread inside its current-thread runtime.
pub(crate) async fn execute_in_isolate(payload: IsolatePayload) -> ExecutionResult {
    let create_params = v8::CreateParams::default().heap_limits(0, payload.heap_bytes);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(create_params),
        ..Default::default()
    });

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    if let Ok(mut slot) = payload.isolate_slot.lock() {
        *slot = Some(runtime.v8_isolate().thread_safe_handle());
    }

    let result = run_isolate_inner(&mut runtime, &payload, &heap_state).await;

    // The handle must not outlive the runtime it points at.
    if let Ok(mut slot) = payload.isolate_slot.lock() {
        slot.take();
    }
    result
}

async fn run_isolate_inner(
    runtime: &mut JsRuntime,
    payload: &IsolatePayload,
    heap_state: &HeapLimitState,
) -> ExecutionResult {
    let inputs_json = match serde_json::to_string(&payload.inputs) {
        Ok(json) => json,
        Err(e) => {
            return ExecutionResult::failure(
                ErrorCode::Internal,
                format!("could not serialize inputs: {}", e),
            )
        }
    };
    if let Err(e) = runtime.execute_script(
        "[crucible:bootstrap]",
        ModuleCodeString::from(bootstrap_script(&inputs_json)),
    ) {
        return ExecutionResult::failure(
            ErrorCode::Internal,
            format!("isolate bootstrap failed: {}", e),
        );
    }

    // CPU watchdog: run_event_loop never regains control from a tight
    // synchronous loop, so termination has to come from another thread.
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = Duration::from_millis(payload.timeout_ms);
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = match runtime.execute_script(
        "[crucible:execute]",
        ModuleCodeString::from(wrap_user_code(&payload.code)),
    ) {
        Ok(_) => {
            match tokio::time::timeout(
                timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    runtime.v8_isolate().thread_safe_handle().terminate_execution();
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // Join before touching heap_state or dropping the runtime.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return ExecutionResult::failure(
            ErrorCode::ResourceExceeded,
            format!(
                "execution exceeded the {} byte memory limit",
                payload.heap_bytes
            ),
        );
    }
    if timed_out.load(Ordering::SeqCst) {
        return ExecutionResult::failure(
            ErrorCode::Timeout,
            format!("execution exceeded the {}ms time limit", payload.timeout_ms),
        );
    }
    if let Some(message) = exec_error {
        return ExecutionResult::failure(ErrorCode::ExecutionFault, message);
    }

    extract_envelope(runtime, payload.max_output_bytes)
}

fn extract_envelope(runtime: &mut JsRuntime, max_output_bytes: usize) -> ExecutionResult {
    let global = match runtime.execute_script(
        "[crucible:extract]",
        ModuleCodeString::from(
            "JSON.stringify({ \
                outcome: globalThis.__crucibleOutcome === undefined ? null : globalThis.__crucibleOutcome, \
                logs: globalThis.__crucibleLogs || [] \
            })"
                .to_string(),
        ),
    ) {
        Ok(global) => global,
        Err(e) => {
            return ExecutionResult::failure(
                ErrorCode::Internal,
                format!("could not extract result: {}", e),
            )
        }
    };

    let json = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        match deno_core::serde_v8::from_v8::<String>(scope, local) {
            Ok(json) => json,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorCode::Internal,
                    format!("could not read result from isolate: {}", e),
                )
            }
        }
    };

    let envelope: IsolateEnvelope = match serde_json::from_str(&json) {
        Ok(envelope) => envelope,
        Err(e) => {
            return ExecutionResult::failure(
                ErrorCode::Internal,
                format!("malformed isolate envelope: {}", e),
            )
        }
    };
    let logs: Vec<LogLine> = envelope
        .logs
        .into_iter()
        .take(MAX_LOG_LINES)
        .map(|l| LogLine::new(l.level, l.message))
        .collect();

    let Some(outcome) = envelope.outcome else {
        return ExecutionResult::failure(
            ErrorCode::ExecutionFault,
            "execution produced no result",
        )
        .with_logs(logs);
    };

    if let Some(error) = outcome.error {
        return ExecutionResult::failure(ErrorCode::ExecutionFault, error)
            .with_stack(outcome.stack)
            .with_logs(logs);
    }

    let output = outcome.ok.unwrap_or(Value::Null);
    // The cap covers the returned value; captured console output is
    // bounded separately by the log-line ceiling.
    let output_size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
    if output_size > max_output_bytes {
        return ExecutionResult::failure(
            ErrorCode::ResourceExceeded,
            format!("output exceeded the {} byte limit", max_output_bytes),
        )
        .with_logs(logs);
    }
    let output_type = if outcome.undef {
        OutputType::Undefined
    } else {
        output_type_of(&output)
    };
    let formatted = if outcome.undef {
        "undefined".to_string()
    } else {
        format_value(&output, &FormatOptions::default())
    };
    ExecutionResult::success(output, formatted, output_type).with_logs(logs)
}

/// Installed before user code: inputs global, frozen capturing console,
/// and removal of `Deno`, `eval`, the `Function` global and the
/// code-generation constructors reachable through prototype chains.
fn bootstrap_script(inputs_json: &str) -> String {
    format!(
        r#"
        globalThis.inputs = {inputs_json};
        (() => {{
            const logs = [];
            globalThis.__crucibleLogs = logs;
            const fmt = (a) => {{
                if (typeof a === "string") return a;
                try {{ return JSON.stringify(a); }} catch (_) {{ return String(a); }}
            }};
            const push = (level) => (...args) => {{
                if (logs.length < {max_log_lines}) {{
                    logs.push({{ level, message: args.map(fmt).join(" ") }});
                }}
            }};
            globalThis.console = Object.freeze({{
                log: push("info"),
                info: push("info"),
                debug: push("debug"),
                warn: push("warn"),
                error: push("error"),
            }});

            delete globalThis.Deno;
            delete globalThis.eval;
            const AsyncFunction = (async function() {{}}).constructor;
            const GeneratorFunction = (function*() {{}}).constructor;
            Object.defineProperty(Function.prototype, "constructor", {{
                value: undefined, configurable: false, writable: false
            }});
            Object.defineProperty(AsyncFunction.prototype, "constructor", {{
                value: undefined, configurable: false, writable: false
            }});
            Object.defineProperty(GeneratorFunction.prototype, "constructor", {{
                value: undefined, configurable: false, writable: false
            }});
            delete globalThis.Function;
        }})();
        "#,
        inputs_json = inputs_json,
        max_log_lines = MAX_LOG_LINES,
    )
}

/// User code becomes the body of an async function, so both `return` and
/// top-level `await` work; the settled value or thrown error lands in a
/// global the extraction script can reach.
fn wrap_user_code(code: &str) -> String {
    format!(
        r#"
        globalThis.__crucibleOutcome = undefined;
        (async () => {{
            try {{
                const __result = await (async () => {{
{code}
                }})();
                globalThis.__crucibleOutcome = {{
                    ok: __result === undefined ? null : __result,
                    undef: __result === undefined,
                }};
            }} catch (e) {{
                globalThis.__crucibleOutcome = {{
                    error: (e && e.message) ? String(e.message) : String(e),
                    stack: (e && e.stack) ? String(e.stack) : null,
                }};
            }}
        }})();
        "#
    )
}
