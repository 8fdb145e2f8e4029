//! Handler contract invoked by the bridge for inbound calls.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::protocol::{RpcEnvelope, RpcErrorBody};

/// Boxed future returned by [`RpcHandler::handle`].
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Value, ToolError>> + Send + 'a>>;

/// Classification of a failed tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Handler raised an error (or panicked).
    Handler,
    /// The per-call RPC timeout elapsed.
    Timeout,
    /// Routing is misconfigured, e.g. a client route without a local handler.
    Configuration,
    /// Server route attempted without an API key.
    MissingCredential,
    /// The remote endpoint answered with an error.
    Remote,
    /// The remote endpoint could not be reached or answered garbage.
    Transport,
    /// The call needs out-of-band approval.
    ApprovalRequired,
}

impl ToolErrorKind {
    /// JSON-RPC error code used on the wire.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Handler => -32000,
            Self::Timeout => -32001,
            Self::Configuration => -32002,
            Self::MissingCredential => -32003,
            Self::Remote => -32004,
            Self::Transport => -32005,
            Self::ApprovalRequired => -32006,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::MissingCredential => "missing_credential",
            Self::Remote => "remote",
            Self::Transport => "transport",
            Self::ApprovalRequired => "approval_required",
        }
    }
}

/// Failure of a single tool call, surfaced to the isolated code.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    /// Classification.
    pub kind: ToolErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Extra structured details merged into the wire error's `data`.
    pub data: Option<Value>,
}

impl ToolError {
    /// Build an error of `kind`.
    #[must_use]
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// Handler failure.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Handler, message)
    }

    /// Routing misconfiguration.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Configuration, message)
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wire representation; `data.kind` always names the classification.
    #[must_use]
    pub fn to_body(&self) -> RpcErrorBody {
        let mut data = match &self.data {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("details".into(), other.clone());
                map
            }
            None => Map::new(),
        };
        data.insert("kind".into(), json!(self.kind.as_str()));
        RpcErrorBody {
            code: self.kind.code(),
            message: self.message.clone(),
            data: Some(Value::Object(data)),
        }
    }
}

impl Display for ToolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ToolError {}

/// Caller-supplied handler for calls arriving from the isolated context.
///
/// Injected into the bridge at construction so tests can swap it freely.
pub trait RpcHandler: Send + Sync {
    /// Serve one call.
    fn handle(&self, method: &str, args: Value) -> HandlerFuture<'_>;

    /// Called once when a call exceeded the RPC timeout and was abandoned.
    fn on_timeout(&self, method: &str, args: &Value, elapsed: Duration) {
        debug!(method, ?elapsed, args_present = !args.is_null(), "rpc call timed out");
    }

    /// Called for `notification` and `context_update` envelopes.
    fn on_notification(&self, envelope: RpcEnvelope) {
        debug!(kind = envelope.kind(), "notification ignored");
    }
}
