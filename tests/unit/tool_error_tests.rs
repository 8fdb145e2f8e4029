//! Tool error codes, wire bodies and approval extraction.

use serde_json::json;

use pml_mediator::models::workflow::ApprovalKind;
use pml_mediator::sandbox::remote::approval_request;
use pml_mediator::sandbox::{ToolError, ToolErrorKind};

#[test]
fn each_kind_has_a_distinct_code() {
    let kinds = [
        ToolErrorKind::Handler,
        ToolErrorKind::Timeout,
        ToolErrorKind::Configuration,
        ToolErrorKind::MissingCredential,
        ToolErrorKind::Remote,
        ToolErrorKind::Transport,
        ToolErrorKind::ApprovalRequired,
    ];
    let mut codes: Vec<i64> = kinds.iter().map(|k| k.code()).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), kinds.len());
    assert_eq!(ToolErrorKind::Handler.code(), -32000);
}

#[test]
fn body_always_names_the_kind() {
    let body = ToolError::configuration("no handler").to_body();
    assert_eq!(body.code, -32002);
    assert_eq!(body.message, "no handler");
    assert_eq!(body.data.unwrap(), json!({ "kind": "configuration" }));
}

#[test]
fn object_data_is_merged_and_scalars_are_wrapped() {
    let merged = ToolError::handler("x").with_data(json!({ "path": "/x" })).to_body();
    assert_eq!(merged.data.unwrap(), json!({ "path": "/x", "kind": "handler" }));

    let wrapped = ToolError::handler("x").with_data(json!(7)).to_body();
    assert_eq!(wrapped.data.unwrap(), json!({ "details": 7, "kind": "handler" }));
}

#[test]
fn display_includes_kind() {
    let err = ToolError::new(ToolErrorKind::MissingCredential, "no api key");
    assert_eq!(err.to_string(), "missing_credential: no api key");
}

#[test]
fn approval_is_extracted_only_from_approval_errors() {
    let err = ToolError::new(ToolErrorKind::ApprovalRequired, "install jq").with_data(json!({
        "approvalType": "dependency",
        "method": "std:jq",
        "payload": { "dependency": "jq" }
    }));
    let request = approval_request(&err).unwrap();
    assert_eq!(request.kind, ApprovalKind::DependencyInstall);
    assert_eq!(request.method, "std:jq");
    assert_eq!(request.payload["dependency"], "jq");

    let plain = ToolError::handler("install jq").with_data(json!({ "approvalType": "dependency" }));
    assert!(approval_request(&plain).is_none());

    let unknown = ToolError::new(ToolErrorKind::ApprovalRequired, "?")
        .with_data(json!({ "approvalType": "oauth", "method": "m" }));
    assert!(approval_request(&unknown).is_none());
}
