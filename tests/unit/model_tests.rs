//! Wire shapes of the domain models.

use serde_json::json;

use pml_mediator::models::execution::{ExecutionError, ExecutionErrorKind, ExecutionResult};
use pml_mediator::models::session::Scope;
use pml_mediator::models::trace::{LocalExecutionTrace, ToolCallRecord};
use pml_mediator::models::workflow::{ApprovalGrant, ApprovalKind};

#[test]
fn trace_serializes_camel_case_with_null_parent() {
    let trace = LocalExecutionTrace::new(
        "fs:read",
        None,
        true,
        5,
        vec![ToolCallRecord::succeeded("fs:read", json!({ "path": "/x" }), json!("hi"), 2)],
    );
    let wire = serde_json::to_value(&trace).unwrap();

    assert!(wire["traceId"].is_string());
    assert!(wire["parentTraceId"].is_null());
    assert_eq!(wire["capabilityId"], "fs:read");
    assert_eq!(wire["durationMs"], 5);
    assert!(wire.get("error").is_none());
    assert_eq!(wire["toolCalls"][0]["tool"], "fs:read");
    assert_eq!(wire["toolCalls"][0]["durationMs"], 2);
    assert!(wire["toolCalls"][0].get("error").is_none());
    assert!(wire["timestamp"].is_string());
}

#[test]
fn failed_call_record_has_no_result() {
    let record = ToolCallRecord::failed("git:push", json!({}), "rejected", 9);
    let wire = serde_json::to_value(&record).unwrap();
    assert_eq!(wire["success"], false);
    assert_eq!(wire["error"], "rejected");
    assert!(wire.get("result").is_none());
}

#[test]
fn execution_result_shapes() {
    let ok = ExecutionResult::ok(json!(42), Vec::new(), 3);
    assert!(ok.success);
    assert_eq!(ok.error_kind(), None);

    let failed = ExecutionResult::failed(
        ExecutionError::new(ExecutionErrorKind::ApprovalRequired, "paused"),
        Vec::new(),
        3,
    );
    let wire = serde_json::to_value(&failed).unwrap();
    assert_eq!(wire["error"]["kind"], "approval_required");
    assert!(wire.get("value").is_none());
    assert_eq!(failed.error_kind(), Some(ExecutionErrorKind::ApprovalRequired));
}

#[test]
fn approval_kind_wire_names() {
    for kind in [
        ApprovalKind::DependencyInstall,
        ApprovalKind::MissingCredential,
        ApprovalKind::IntegrityMismatch,
    ] {
        assert_eq!(ApprovalKind::from_wire(kind.as_wire()), Some(kind));
        assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_wire());
    }
    assert_eq!(ApprovalKind::from_wire("oauth"), None);
}

#[test]
fn grant_serializes_for_meta() {
    let grant = ApprovalGrant {
        workflow_id: "wf".into(),
        kind: ApprovalKind::MissingCredential,
        method: "search:web".into(),
        payload: json!({ "key": "SERP_API_KEY" }),
    };
    assert_eq!(
        serde_json::to_value(&grant).unwrap(),
        json!({
            "workflowId": "wf",
            "kind": "api_key_required",
            "method": "search:web",
            "payload": { "key": "SERP_API_KEY" }
        })
    );
}

#[test]
fn scope_fqdn_dots_namespaces() {
    let scope = Scope {
        org: "acme".into(),
        project: "web".into(),
    };
    assert_eq!(scope.fqdn("std:json:parse"), "acme.web.std.json.parse");
    assert_eq!(scope.fqdn("plain"), "acme.web.plain");
}
