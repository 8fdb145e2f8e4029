//! JSON-RPC 2.0 adapter for embedded UI surfaces.
//!
//! # Inbound mapping
//!
//! | External method            | Internal envelope                 |
//! |----------------------------|-----------------------------------|
//! | `ui/initialize`            | [`RpcEnvelope::Init`]             |
//! | `tools/call`               | [`RpcEnvelope::Rpc`] (needs name) |
//! | `ui/update-model-context`  | [`RpcEnvelope::ContextUpdate`]    |
//! | `notifications/*`          | [`RpcEnvelope::Notification`]     |
//! | *(anything else)*          | filtered (`None`)                 |
//!
//! # Outbound mapping
//!
//! Responses become `{jsonrpc, id, result}` / `{jsonrpc, id, error}` keyed by
//! `id ?? rpcId ?? ""`. Every other envelope passes through unchanged.

use serde_json::{json, Value};
use tracing::debug;

use super::{ProtocolAdapter, RpcEnvelope};

/// Handshake method.
pub const METHOD_INITIALIZE: &str = "ui/initialize";
/// Call-invocation method.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Context-update notification method.
pub const METHOD_CONTEXT_UPDATE: &str = "ui/update-model-context";
/// Prefix shared by all notification methods.
pub const NOTIFICATION_PREFIX: &str = "notifications/";

/// Stateless JSON-RPC 2.0 ⇄ [`RpcEnvelope`] translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcAdapter;

impl ProtocolAdapter for JsonRpcAdapter {
    fn to_internal(&self, external: &Value) -> Option<RpcEnvelope> {
        let method = external.get("method").and_then(Value::as_str)?;
        let id = external.get("id").filter(|id| !id.is_null()).cloned();
        let params = external.get("params").cloned().unwrap_or(Value::Null);

        match method {
            METHOD_INITIALIZE => Some(RpcEnvelope::Init { id, params }),
            METHOD_TOOLS_CALL => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    debug!("jsonrpc adapter: tools/call without a tool name dropped");
                    return None;
                };
                let rpc_id = id.as_ref().map_or_else(
                    || uuid::Uuid::new_v4().to_string(),
                    correlation_key,
                );
                Some(RpcEnvelope::Rpc {
                    rpc_id,
                    method: name.to_owned(),
                    args: params.get("arguments").cloned().unwrap_or_else(|| json!({})),
                    id,
                })
            }
            METHOD_CONTEXT_UPDATE => Some(RpcEnvelope::ContextUpdate { params }),
            m if m.starts_with(NOTIFICATION_PREFIX) => Some(RpcEnvelope::Notification {
                method: m.to_owned(),
                params,
            }),
            other => {
                debug!(method = other, "jsonrpc adapter: unrecognized method filtered");
                None
            }
        }
    }

    fn to_external(&self, internal: &RpcEnvelope) -> Value {
        match internal {
            RpcEnvelope::RpcResponse { id, rpc_id, result } => json!({
                "jsonrpc": "2.0",
                "id": response_id(id.as_ref(), Some(rpc_id)),
                "result": result,
            }),
            RpcEnvelope::RpcError { id, rpc_id, error } => json!({
                "jsonrpc": "2.0",
                "id": response_id(id.as_ref(), Some(rpc_id)),
                "error": error,
            }),
            RpcEnvelope::InitResponse { id, result } => json!({
                "jsonrpc": "2.0",
                "id": response_id(id.as_ref(), None),
                "result": result,
            }),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        }
    }
}

/// Render an external id as a correlation key (`7` → `"7"`, `"a"` → `"a"`).
fn correlation_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `id ?? rpcId ?? ""`.
fn response_id(id: Option<&Value>, rpc_id: Option<&String>) -> Value {
    id.cloned()
        .or_else(|| rpc_id.map(|r| Value::String(r.clone())))
        .unwrap_or_else(|| Value::String(String::new()))
}
