//! Server-routed tool calls.
//!
//! A call routed to the server is posted as a JSON-RPC `tools/call` to
//! `{cloud}/mcp` with the session headers attached. Every failure mode
//! (missing credential, unreachable endpoint, non-2xx, protocol error) is
//! mapped into a [`ToolError`] so the isolated code observes it as a failed
//! call and the execution carries on.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bridge::{ToolError, ToolErrorKind};
use crate::models::workflow::{ApprovalKind, ApprovalRequest};
use crate::{AppError, Result};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the registered session id.
pub const SESSION_HEADER: &str = "X-PML-Session";

/// Supplies the headers every remote call must attach.
///
/// Implemented by the session client; tests substitute [`StaticHeaders`].
pub trait HeaderSource: Send + Sync {
    /// Current headers (API key plus session id when registered).
    fn headers(&self) -> HeaderMap;
}

/// Fixed header set.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders(pub HeaderMap);

impl HeaderSource for StaticHeaders {
    fn headers(&self) -> HeaderMap {
        self.0.clone()
    }
}

/// JSON-RPC client for the remote tool endpoint.
pub struct RemoteToolClient {
    http: reqwest::Client,
    endpoint: String,
    headers: Arc<dyn HeaderSource>,
}

impl RemoteToolClient {
    /// Client posting to `{base_url}/mcp`, each request bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration, headers: Arc<dyn HeaderSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Http(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/mcp", base_url.trim_end_matches('/')),
            headers,
        })
    }

    /// Forward one call.
    ///
    /// `meta` is attached as `params._meta` when present (used to carry an
    /// approval grant on resumed executions).
    ///
    /// # Errors
    ///
    /// - `MissingCredential`: no API key header is available.
    /// - `Transport`: the endpoint was unreachable, answered non-2xx, or sent
    ///   a body that is not a JSON-RPC response.
    /// - `Remote`: the endpoint answered with a JSON-RPC error.
    /// - `ApprovalRequired`: the JSON-RPC error asks for out-of-band approval.
    pub async fn call(
        &self,
        method: &str,
        args: Value,
        meta: Option<Value>,
    ) -> std::result::Result<Value, ToolError> {
        let headers = self.headers.headers();
        if !headers.contains_key(API_KEY_HEADER) {
            return Err(ToolError::new(
                ToolErrorKind::MissingCredential,
                format!("no api key configured for server-routed call '{method}'"),
            ));
        }

        let mut params = json!({ "name": method, "arguments": args });
        if let (Some(meta), Some(map)) = (meta, params.as_object_mut()) {
            map.insert("_meta".into(), meta);
        }
        let request = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": "tools/call",
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .headers(headers)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                warn!(method, %err, "remote tool call failed");
                ToolError::new(
                    ToolErrorKind::Transport,
                    format!("remote endpoint unreachable: {err}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::new(
                ToolErrorKind::Transport,
                format!("remote endpoint returned HTTP {status}"),
            ));
        }

        let body: Value = response.json().await.map_err(|err| {
            ToolError::new(
                ToolErrorKind::Transport,
                format!("remote endpoint sent an invalid body: {err}"),
            )
        })?;
        debug!(method, "remote tool call answered");
        unwrap_response(method, body)
    }
}

/// Map a JSON-RPC response body to a call outcome.
fn unwrap_response(method: &str, mut body: Value) -> std::result::Result<Value, ToolError> {
    if let Some(error) = body.get("error").filter(|err| !err.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("remote tool call failed")
            .to_owned();
        let data = error.get("data").cloned().unwrap_or(Value::Null);
        return Err(approval_error(method, &message, &data)
            .unwrap_or_else(|| ToolError::new(ToolErrorKind::Remote, message)));
    }

    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(ToolError::new(
            ToolErrorKind::Transport,
            "remote response has neither result nor error",
        )),
    }
}

/// `error.data` of the form `{approvalRequired: true, approvalType, …}`.
fn approval_error(method: &str, message: &str, data: &Value) -> Option<ToolError> {
    if data.get("approvalRequired").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let Some(kind) = data
        .get("approvalType")
        .and_then(Value::as_str)
        .and_then(ApprovalKind::from_wire)
    else {
        warn!(method, "approval requested with unknown approvalType; treated as remote error");
        return None;
    };
    Some(
        ToolError::new(ToolErrorKind::ApprovalRequired, message).with_data(json!({
            "approvalType": kind.as_wire(),
            "method": method,
            "payload": data,
        })),
    )
}

/// Recover the [`ApprovalRequest`] carried by an `ApprovalRequired` error.
#[must_use]
pub fn approval_request(error: &ToolError) -> Option<ApprovalRequest> {
    if error.kind != ToolErrorKind::ApprovalRequired {
        return None;
    }
    let data = error.data.as_ref()?;
    let kind = data
        .get("approvalType")
        .and_then(Value::as_str)
        .and_then(ApprovalKind::from_wire)?;
    Some(ApprovalRequest {
        kind,
        method: data.get("method").and_then(Value::as_str)?.to_owned(),
        payload: data.get("payload").cloned().unwrap_or(Value::Null),
    })
}
