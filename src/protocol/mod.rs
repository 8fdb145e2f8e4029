//! Internal RPC envelope and protocol adapters.
//!
//! Every message crossing the isolation boundary is translated into an
//! [`RpcEnvelope`] before the bridge looks at it. Adapters are stateless
//! and swappable: the bridge never assumes a particular wire format.
//!
//! | Adapter            | External format                                 |
//! |--------------------|-------------------------------------------------|
//! | [`NativeAdapter`]  | the envelope itself, tagged on `type`           |
//! | [`JsonRpcAdapter`] | JSON-RPC 2.0 (`tools/call`, `ui/initialize`, …) |

pub mod jsonrpc;
pub mod native;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use jsonrpc::JsonRpcAdapter;
pub use native::NativeAdapter;

/// Error body carried by [`RpcEnvelope::RpcError`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorBody {
    /// Build an error body without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Closed set of messages exchanged with an isolated context.
///
/// `rpc_id` is the correlation key; `id` is an optional external identifier
/// (e.g. a JSON-RPC id) carried through unchanged so responses can echo it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcEnvelope {
    /// Handshake request from the isolated context.
    Init {
        /// External request id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Handshake parameters.
        #[serde(default)]
        params: Value,
    },
    /// Handshake reply from the host.
    InitResponse {
        /// External request id being answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Host capabilities.
        #[serde(default)]
        result: Value,
    },
    /// Call expecting exactly one response.
    Rpc {
        /// External request id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Correlation id.
        #[serde(rename = "rpcId")]
        rpc_id: String,
        /// Called method.
        method: String,
        /// Call arguments.
        #[serde(default)]
        args: Value,
    },
    /// Successful reply to an [`RpcEnvelope::Rpc`].
    RpcResponse {
        /// External request id being answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Correlation id being answered.
        #[serde(rename = "rpcId")]
        rpc_id: String,
        /// Call result.
        #[serde(default)]
        result: Value,
    },
    /// Failed reply to an [`RpcEnvelope::Rpc`].
    RpcError {
        /// External request id being answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Correlation id being answered.
        #[serde(rename = "rpcId")]
        rpc_id: String,
        /// Error details.
        error: RpcErrorBody,
    },
    /// Fire-and-forget message; never answered.
    Notification {
        /// Notification method.
        method: String,
        /// Notification parameters.
        #[serde(default)]
        params: Value,
    },
    /// Model-context update pushed by an embedded surface.
    ContextUpdate {
        /// Updated context.
        #[serde(default)]
        params: Value,
    },
}

impl RpcEnvelope {
    /// Wire tag of this variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::InitResponse { .. } => "init_response",
            Self::Rpc { .. } => "rpc",
            Self::RpcResponse { .. } => "rpc_response",
            Self::RpcError { .. } => "rpc_error",
            Self::Notification { .. } => "notification",
            Self::ContextUpdate { .. } => "context_update",
        }
    }
}

/// Stateless translator between an external wire format and [`RpcEnvelope`].
pub trait ProtocolAdapter: Send + Sync {
    /// Translate an inbound external message.
    ///
    /// Returns `None` for messages that must be filtered rather than
    /// forwarded; never fails.
    fn to_internal(&self, external: &Value) -> Option<RpcEnvelope>;

    /// Translate an outbound envelope into the external format.
    fn to_external(&self, internal: &RpcEnvelope) -> Value;
}
