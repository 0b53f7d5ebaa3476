//! Container isolation backend
//!
//! Runs Python (primary) and JavaScript/TypeScript (secondary) inside
//! freshly created, auto-removed containers: no network by default, fixed
//! memory and memory+swap ceilings, a single-CPU quota, a process-count
//! limit, read-only root filesystem with a small writable tmpfs, a
//! least-privilege user and no-new-privileges. Output is streamed and
//! hard-capped; exceeding the cap stops the container early instead of
//! growing host memory.
//!
//! When the container runtime cannot be reached, Python degrades to
//! direct-process execution with the same workspace, timeout, kill and
//! output-cap mechanics but without filesystem/network/cgroup isolation.
//! That path reports `BackendKind::Process` so audit records distinguish
//! reduced-trust runs.

use crate::config::ContainerConfig;
use crate::core_types::{
    BackendKind, EffectiveLimits, ErrorCode, ExecutionContext, ExecutionResult, Language,
    LogLevel, LogLine, OutputType, ResourceLimits, MAX_LOG_LINES,
};
use crate::sandbox::format::{format_value, output_type_of, FormatOptions};
use crate::sandbox::typescript::strip_types;
use crate::sandbox::{BackendStatus, ExecutionTracker, IsolationBackend};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;

const RESULT_MARKER: &str = "__CRUCIBLE_RESULT__";
/// Both launchers phrase module rejections with this suffix so the host
/// can tell a policy rejection apart from an ordinary crash.
const ALLOW_LIST_MARKER: &str = "is not in the allow-list";
const CONTAINER_WORKSPACE: &str = "/workspace";
const STOP_GRACE_SECONDS: i32 = 2;

static SUPPORTED: &[Language] = &[Language::Python, Language::Javascript, Language::Typescript];

pub struct ContainerBackend {
    tracker: Arc<ExecutionTracker>,
    config: ContainerConfig,
    docker: Option<Docker>,
    docker_available: OnceCell<bool>,
    python_path: OnceCell<Option<PathBuf>>,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig, tracker: ExecutionTracker) -> Self {
        let docker = match Docker::connect_with_local_defaults() {
            Ok(docker) => Some(docker),
            Err(e) => {
                log::warn!("docker client could not be constructed: {}", e);
                None
            }
        };
        Self {
            tracker: Arc::new(tracker),
            config,
            docker,
            docker_available: OnceCell::new(),
            python_path: OnceCell::new(),
        }
    }

    async fn docker_is_available(&self) -> bool {
        *self
            .docker_available
            .get_or_init(|| async {
                match &self.docker {
                    Some(docker) => docker.ping().await.is_ok(),
                    None => false,
                }
            })
            .await
    }

    async fn python_fallback(&self) -> Option<PathBuf> {
        self.python_path
            .get_or_init(|| async { which::which("python3").ok() })
            .await
            .clone()
    }

    fn image_and_cmd(&self, language: Language) -> (String, Vec<String>) {
        let script = format!("{}/{}", CONTAINER_WORKSPACE, script_name(language));
        match language {
            Language::Python => (
                self.config.python_image.clone(),
                vec!["python".to_string(), script],
            ),
            _ => (self.config.node_image.clone(), vec!["node".to_string(), script]),
        }
    }

    async fn run_container(
        &self,
        code: &str,
        language: Language,
        context: &ExecutionContext,
        limits: &EffectiveLimits,
    ) -> ExecutionResult {
        let Some(docker) = &self.docker else {
            return ExecutionResult::failure(
                ErrorCode::BackendUnavailable,
                "container runtime is not reachable",
            );
        };

        let workspace = match write_workspace(code, language, context).await {
            Ok(workspace) => workspace,
            Err(e) => return ExecutionResult::failure(ErrorCode::Internal, e),
        };
        let host_dir = match workspace.path().to_str() {
            Some(path) => path.to_string(),
            None => {
                return ExecutionResult::failure(
                    ErrorCode::Internal,
                    "workspace path is not valid UTF-8",
                )
            }
        };

        let (image, cmd) = self.image_and_cmd(language);
        let env = context.env.as_ref().map(|vars| {
            vars.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
        });

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("crucible-{}", context.execution_id)),
            ..Default::default()
        });
        let body = ContainerCreateBody {
            image: Some(image),
            cmd: Some(cmd),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            user: Some("65534:65534".to_string()),
            env,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!("{}:{}:ro", host_dir, CONTAINER_WORKSPACE)]),
                auto_remove: Some(true),
                network_mode: Some(self.config.network_mode.clone()),
                memory: Some(limits.max_memory_bytes as i64),
                memory_swap: Some(limits.max_memory_bytes as i64),
                nano_cpus: Some(1_000_000_000),
                pids_limit: Some(self.config.pids_limit),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    format!("rw,noexec,size={}", self.config.tmpfs_bytes),
                )])),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                cap_drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = match docker.create_container(options, body).await {
            Ok(container) => container,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorCode::BackendUnavailable,
                    format!("could not create container: {}", e),
                )
            }
        };
        let container_id = container.id.clone();

        // Best-effort cancellation: stop the container with a short grace.
        {
            let docker = docker.clone();
            let container_id = container_id.clone();
            self.tracker.track(
                &context.execution_id,
                Box::new(move || {
                    let docker = docker.clone();
                    let container_id = container_id.clone();
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            let _ = docker
                                .stop_container(
                                    &container_id,
                                    Some(BollardStopContainerOptionsQuery {
                                        t: Some(STOP_GRACE_SECONDS),
                                        ..Default::default()
                                    }),
                                )
                                .await;
                        });
                    }
                }),
            );
        }

        if let Err(e) = docker
            .start_container(&container_id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            // auto_remove only fires on exit; a created-but-never-started
            // container has to be removed explicitly.
            let _ = docker
                .remove_container(
                    &container_id,
                    Some(BollardRemoveContainerOptionsQuery {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return ExecutionResult::failure(
                ErrorCode::BackendUnavailable,
                format!("could not start container: {}", e),
            );
        }

        let mut wait_stream =
            docker.wait_container(&container_id, None::<BollardWaitContainerOptionsQuery>);
        let mut log_stream = docker.logs(
            &container_id,
            Some(BollardLogsOptionsQuery {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let timeout = tokio::time::sleep(Duration::from_millis(limits.max_execution_time_ms));
        tokio::pin!(timeout);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code: Option<i64> = None;
        let mut logs_done = false;
        let mut wait_done = false;

        loop {
            tokio::select! {
                log = log_stream.next(), if !logs_done => {
                    match log {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => logs_done = true,
                    }
                    if stdout.len() + stderr.len() > limits.max_output_bytes {
                        let _ = docker
                            .stop_container(
                                &container_id,
                                Some(BollardStopContainerOptionsQuery {
                                    t: Some(STOP_GRACE_SECONDS),
                                    ..Default::default()
                                }),
                            )
                            .await;
                        return ExecutionResult::failure(
                            ErrorCode::ResourceExceeded,
                            format!(
                                "output exceeded the {} byte limit",
                                limits.max_output_bytes
                            ),
                        )
                        .with_logs(collect_logs(&stdout, &stderr));
                    }
                }
                wait = wait_stream.next(), if !wait_done => {
                    match wait {
                        Some(Ok(response)) => exit_code = Some(response.status_code),
                        Some(Err(e)) => {
                            // bollard surfaces non-zero exits as errors on
                            // some daemons; treat as a plain failure below.
                            log::debug!("container wait error: {}", e);
                            exit_code = exit_code.or(Some(-1));
                        }
                        None => {}
                    }
                    wait_done = true;
                }
                _ = &mut timeout => {
                    log::warn!("execution {} timed out in container", context.execution_id);
                    let _ = docker
                        .stop_container(
                            &container_id,
                            Some(BollardStopContainerOptionsQuery {
                                t: Some(STOP_GRACE_SECONDS),
                                ..Default::default()
                            }),
                        )
                        .await;
                    return ExecutionResult::failure(
                        ErrorCode::Timeout,
                        format!(
                            "execution exceeded the {}ms time limit",
                            limits.max_execution_time_ms
                        ),
                    )
                    .with_logs(collect_logs(&stdout, &stderr));
                }
            }
            if wait_done && logs_done {
                break;
            }
        }

        parse_outcome(exit_code.unwrap_or(-1), &stdout, &stderr, limits)
    }

    async fn run_process(
        &self,
        code: &str,
        context: &ExecutionContext,
        limits: &EffectiveLimits,
        python: PathBuf,
    ) -> ExecutionResult {
        let workspace = match write_workspace(code, Language::Python, context).await {
            Ok(workspace) => workspace,
            Err(e) => return ExecutionResult::failure(ErrorCode::Internal, e),
        };
        let script = workspace.path().join(script_name(Language::Python));

        let mut command = Command::new(python);
        command
            .arg(&script)
            .current_dir(workspace.path())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &context.env {
            command.envs(env);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorCode::BackendUnavailable,
                    format!("could not spawn python process: {}", e),
                )
            }
        };

        let (Some(mut child_stdout), Some(mut child_stderr)) =
            (child.stdout.take(), child.stderr.take())
        else {
            return ExecutionResult::failure(ErrorCode::Internal, "child process pipes missing");
        };

        let timeout = tokio::time::sleep(Duration::from_millis(limits.max_execution_time_ms));
        tokio::pin!(timeout);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut out_open = true;
        let mut err_open = true;
        let mut status: Option<std::process::ExitStatus> = None;

        loop {
            tokio::select! {
                read = child_stdout.read(&mut out_buf), if out_open => {
                    match read {
                        Ok(0) | Err(_) => out_open = false,
                        Ok(n) => stdout.push_str(&String::from_utf8_lossy(&out_buf[..n])),
                    }
                }
                read = child_stderr.read(&mut err_buf), if err_open => {
                    match read {
                        Ok(0) | Err(_) => err_open = false,
                        Ok(n) => stderr.push_str(&String::from_utf8_lossy(&err_buf[..n])),
                    }
                }
                exit = child.wait(), if status.is_none() => {
                    status = exit.ok();
                    if status.is_none() {
                        break;
                    }
                }
                _ = &mut timeout => {
                    let _ = child.kill().await;
                    return ExecutionResult::failure(
                        ErrorCode::Timeout,
                        format!(
                            "execution exceeded the {}ms time limit",
                            limits.max_execution_time_ms
                        ),
                    )
                    .with_logs(collect_logs(&stdout, &stderr));
                }
            }
            if stdout.len() + stderr.len() > limits.max_output_bytes {
                let _ = child.kill().await;
                return ExecutionResult::failure(
                    ErrorCode::ResourceExceeded,
                    format!("output exceeded the {} byte limit", limits.max_output_bytes),
                )
                .with_logs(collect_logs(&stdout, &stderr));
            }
            if status.is_some() && !out_open && !err_open {
                break;
            }
        }

        let code = status.and_then(|s| s.code()).unwrap_or(-1) as i64;
        parse_outcome(code, &stdout, &stderr, limits)
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
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
                format!("container backend cannot execute {}", language),
            );
        }

        let docker_up = self.docker_is_available().await;
        let fallback = if docker_up {
            None
        } else if language == Language::Python {
            self.python_fallback().await
        } else {
            None
        };
        let degraded = !docker_up && fallback.is_some();

        self.tracker
            .run(code, language, context, limits, degraded, move |limits| async move {
                if docker_up {
                    self.run_container(code, language, context, &limits).await
                } else if let Some(python) = fallback {
                    log::warn!(
                        "execution {} running in degraded direct-process mode",
                        context.execution_id
                    );
                    self.run_process(code, context, &limits, python).await
                } else {
                    ExecutionResult::failure(
                        ErrorCode::BackendUnavailable,
                        "container runtime is unavailable and no process fallback exists",
                    )
                }
            })
            .await
    }

    async fn is_available(&self) -> bool {
        self.docker_is_available().await || self.python_fallback().await.is_some()
    }

    async fn terminate(&self, execution_id: &str) {
        self.tracker.terminate(execution_id);
    }

    async fn status(&self) -> BackendStatus {
        let docker_up = self.docker_is_available().await;
        BackendStatus {
            kind: BackendKind::Container,
            available: self.is_available().await,
            degraded: !docker_up,
            running: self.tracker.running_count(),
        }
    }

    async fn cleanup(&self) {
        self.tracker.terminate_all();
    }
}

fn script_name(language: Language) -> &'static str {
    match language {
        Language::Python => "step.py",
        _ => "step.js",
    }
}

/// Write the launcher script and serialized inputs into a throwaway
/// workspace directory named by execution id. The directory is removed
/// when the returned guard drops, success or failure.
async fn write_workspace(
    code: &str,
    language: Language,
    context: &ExecutionContext,
) -> Result<tempfile::TempDir, String> {
    let workspace = tempfile::Builder::new()
        .prefix(&format!("crucible-{}-", context.execution_id))
        .tempdir()
        .map_err(|e| format!("could not create workspace: {}", e))?;

    let inputs = serde_json::to_string(&context.inputs)
        .map_err(|e| format!("could not serialize inputs: {}", e))?;
    tokio::fs::write(workspace.path().join("inputs.json"), inputs)
        .await
        .map_err(|e| format!("could not write inputs: {}", e))?;

    let allowed = context.allowed_modules.as_deref();
    let script = match language {
        Language::Python => python_launcher(code, allowed),
        Language::Typescript => node_launcher(&strip_types(code), allowed),
        _ => node_launcher(code, allowed),
    };
    let script_path = workspace.path().join(script_name(language));
    let mut file = tokio::fs::File::create(&script_path)
        .await
        .map_err(|e| format!("could not create script: {}", e))?;
    file.write_all(script.as_bytes())
        .await
        .map_err(|e| format!("could not write script: {}", e))?;
    file.flush()
        .await
        .map_err(|e| format!("could not flush script: {}", e))?;

    Ok(workspace)
}

fn json_string_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Launcher: user code runs at module level with `inputs` bound; a
/// variable named `result` (if defined) becomes the step output. When a
/// module allow-list is present, `__import__` is replaced before user
/// code runs and rejects anything whose top-level package is not listed.
fn python_launcher(code: &str, allowed_modules: Option<&[String]>) -> String {
    let import_gate = match allowed_modules {
        Some(allowed) => format!(
            r#"import builtins as _crucible_builtins
_crucible_allowed = set(_crucible_json.loads('{allowed}'))
_crucible_real_import = _crucible_builtins.__import__
def _crucible_import(name, *args, **kwargs):
    if name.split(".")[0] not in _crucible_allowed:
        raise ImportError("module '%s' is not in the allow-list" % name)
    return _crucible_real_import(name, *args, **kwargs)
_crucible_builtins.__import__ = _crucible_import
"#,
            allowed = json_string_list(allowed),
        ),
        None => String::new(),
    };
    format!(
        r#"import json as _crucible_json
with open("inputs.json") as _crucible_f:
    inputs = _crucible_json.load(_crucible_f)
{import_gate}
{code}

try:
    _crucible_r = result
except NameError:
    _crucible_r = None
print("{marker}" + _crucible_json.dumps(_crucible_r, default=str))
"#,
        import_gate = import_gate,
        code = code,
        marker = RESULT_MARKER,
    )
}

/// Launcher: user code runs inside an async function so `return` works.
/// When a module allow-list is present, `require` is shadowed in the
/// user code's scope with an allow-list check.
fn node_launcher(code: &str, allowed_modules: Option<&[String]>) -> String {
    let require_gate = match allowed_modules {
        Some(allowed) => format!(
            r#"    const require = (name) => {{
        if (!new Set({allowed}).has(name)) {{
            throw new Error("module '" + name + "' is not in the allow-list");
        }}
        return __realRequire(name);
    }};
    void require;
"#,
            allowed = json_string_list(allowed),
        ),
        None => String::new(),
    };
    format!(
        r#"const __realRequire = require;
const inputs = JSON.parse(__realRequire("fs").readFileSync(__dirname + "/inputs.json", "utf8"));
const __run = async () => {{
{require_gate}{code}
}};
__run().then((r) => {{
    console.log("{marker}" + JSON.stringify(r === undefined ? null : r));
}}).catch((e) => {{
    console.error(String((e && e.stack) || e));
    process.exit(1);
}});
"#,
        require_gate = require_gate,
        code = code,
        marker = RESULT_MARKER,
    )
}

fn collect_logs(stdout: &str, stderr: &str) -> Vec<LogLine> {
    let mut logs = Vec::new();
    for line in stdout.lines() {
        if line.starts_with(RESULT_MARKER) || logs.len() >= MAX_LOG_LINES {
            continue;
        }
        logs.push(LogLine::new(LogLevel::Info, line));
    }
    for line in stderr.lines() {
        if logs.len() >= MAX_LOG_LINES {
            break;
        }
        logs.push(LogLine::new(LogLevel::Error, line));
    }
    logs
}

fn parse_outcome(
    exit_code: i64,
    stdout: &str,
    stderr: &str,
    limits: &EffectiveLimits,
) -> ExecutionResult {
    let logs = collect_logs(stdout, stderr);
    if exit_code != 0 {
        let message = stderr
            .lines()
            .last()
            .unwrap_or("sandboxed process exited with a non-zero status")
            .to_string();
        let stack = if stderr.trim().is_empty() {
            None
        } else {
            Some(stderr.trim().to_string())
        };
        let code = if stderr.contains(ALLOW_LIST_MARKER) {
            ErrorCode::SecurityViolation
        } else {
            ErrorCode::ExecutionFault
        };
        return ExecutionResult::failure(code, message)
            .with_stack(stack)
            .with_logs(logs);
    }

    let output: Value = stdout
        .lines()
        .rev()
        .find(|line| line.starts_with(RESULT_MARKER))
        .and_then(|line| serde_json::from_str(&line[RESULT_MARKER.len()..]).ok())
        .unwrap_or(Value::Null);

    let mut formatted = format_value(&output, &FormatOptions::default());
    if formatted.len() > limits.max_output_bytes {
        let mut end = limits.max_output_bytes;
        while !formatted.is_char_boundary(end) {
            end -= 1;
        }
        formatted.truncate(end);
        formatted.push_str("...(truncated)");
    }
    let output_type = output_type_of(&output);
    let mut result = ExecutionResult::success(output, formatted, output_type);
    result.logs = logs;
    result
}
