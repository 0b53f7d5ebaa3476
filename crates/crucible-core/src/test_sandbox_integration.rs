//! End-to-end tests through the `Sandbox` composition root: admission,
//! routing, backend execution and the audit trail working together.

use crate::audit::{AuditEventType, AuditQuery};
use crate::config::{AuditConfig, AuditStorageKind, BackendChoice, SandboxConfig};
use crate::core_types::{BackendKind, ErrorCode, ExecutionContext, Language, OutputType};
use crate::runtime::Sandbox;
use serde_json::json;

fn test_config(backends: Vec<BackendChoice>) -> SandboxConfig {
    SandboxConfig {
        backends,
        audit: AuditConfig {
            enabled: true,
            storage: AuditStorageKind::Memory,
            path: None,
            capacity: 1_000,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn sql_step_runs_end_to_end_with_audit_trail() {
    let sandbox = Sandbox::initialize(test_config(vec![BackendChoice::Native]))
        .await
        .unwrap();
    let context = ExecutionContext::new("transform", "user-1").with_input(
        "orders",
        json!([
            { "id": 1, "total": 10 },
            { "id": 2, "total": 32 }
        ]),
    );
    let execution_id = context.execution_id.clone();

    let result = sandbox
        .execute(
            "SELECT COUNT(*) AS n FROM orders",
            Language::Sql,
            context,
            None,
            0,
        )
        .await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output_type, OutputType::String);
    assert!(result.formatted_output.contains("n"));

    let audit = sandbox.audit().unwrap();
    let entries = audit
        .query(&AuditQuery {
            execution_id: Some(execution_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].event, AuditEventType::Complete);
    assert_eq!(entries[1].event, AuditEventType::Start);
    assert_eq!(entries[0].backend, BackendKind::Native);
    assert_eq!(entries[0].code_hash.len(), 64);
    // The raw statement never reaches the trail.
    assert!(!entries[0].code_hash.contains("SELECT"));
}

#[tokio::test]
async fn javascript_step_routes_to_the_vm_isolate() {
    let sandbox = Sandbox::initialize(test_config(vec![
        BackendChoice::VmIsolate,
        BackendChoice::Native,
    ]))
    .await
    .unwrap();
    let context = ExecutionContext::new("compute", "user-1")
        .with_input("a", json!(2))
        .with_input("b", json!(3));

    let result = sandbox
        .execute("return inputs.a + inputs.b;", Language::Javascript, context, None, 0)
        .await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output, json!(5));

    let status = sandbox.status().await;
    assert_eq!(
        status.registry.languages.get(&Language::Javascript),
        Some(&BackendKind::VmIsolate)
    );
    assert_eq!(status.queue.total_executed, 1);
    assert_eq!(status.queue.total_failed, 0);
}

#[tokio::test]
async fn failed_steps_settle_as_results_and_hit_the_error_trail() {
    let sandbox = Sandbox::initialize(test_config(vec![BackendChoice::VmIsolate]))
        .await
        .unwrap();
    let context = ExecutionContext::new("compute", "user-1");
    let execution_id = context.execution_id.clone();

    let result = sandbox
        .execute("throw new Error(\"bad step\");", Language::Javascript, context, None, 0)
        .await;
    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::ExecutionFault));

    let errors = sandbox
        .audit()
        .unwrap()
        .query(&AuditQuery {
            execution_id: Some(execution_id),
            event: Some(AuditEventType::Error),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.as_deref(), Some("bad step"));
}

#[tokio::test]
async fn unrouted_languages_settle_without_touching_the_audit_trail() {
    let sandbox = Sandbox::initialize(test_config(vec![BackendChoice::Native]))
        .await
        .unwrap();
    let context = ExecutionContext::new("compute", "user-1");

    let result = sandbox
        .execute("print(1)", Language::Python, context, None, 0)
        .await;
    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::UnsupportedLanguage));

    let count = sandbox
        .audit()
        .unwrap()
        .count(&AuditQuery::default())
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn shutdown_settles_queued_work() {
    let sandbox = Sandbox::initialize(test_config(vec![BackendChoice::Native]))
        .await
        .unwrap();
    sandbox.queue().pause();
    let rx = sandbox.queue().submit(
        "SELECT 1",
        Language::Sql,
        ExecutionContext::new("n", "u"),
        None,
        0,
    );
    sandbox.shutdown().await;

    let result = rx.await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::QueueCleared));
    assert!(!sandbox.cancel("no-such-id").await);
}
