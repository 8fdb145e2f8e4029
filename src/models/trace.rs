//! Tool call records and execution traces.
//!
//! Both types serialize in the camelCase shape expected by the remote trace
//! store (`POST /api/traces`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One intercepted call made by the isolated code.
///
/// Appended by the executor as the call completes and never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Called method, e.g. `fs:read`.
    pub tool: String,
    /// Input arguments as sent by the isolated code.
    pub args: Value,
    /// Result value when the call succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall-clock duration of the call in milliseconds.
    pub duration_ms: u64,
}

impl ToolCallRecord {
    /// Record a successful call.
    #[must_use]
    pub fn succeeded(tool: impl Into<String>, args: Value, result: Value, duration_ms: u64) -> Self {
        Self {
            tool: tool.into(),
            args,
            result: Some(result),
            error: None,
            success: true,
            duration_ms,
        }
    }

    /// Record a failed call.
    #[must_use]
    pub fn failed(
        tool: impl Into<String>,
        args: Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool: tool.into(),
            args,
            result: None,
            error: Some(error.into()),
            success: false,
            duration_ms,
        }
    }
}

/// One completed execution, queued for sync to the remote store.
///
/// `parent_trace_id` is serialized as `null` for root traces; the store
/// enforces a foreign key from child to parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalExecutionTrace {
    /// Unique trace identifier.
    pub trace_id: String,
    /// Parent trace, or `None` for a root execution.
    pub parent_trace_id: Option<String>,
    /// Capability or method identifier the execution ran for.
    pub capability_id: String,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Error message for failed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution duration in milliseconds.
    pub duration_ms: u64,
    /// Calls made during the execution, in completion order.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Completion timestamp.
    pub timestamp: DateTime<Utc>,
}

impl LocalExecutionTrace {
    /// Construct a trace with a fresh identifier stamped now.
    #[must_use]
    pub fn new(
        capability_id: impl Into<String>,
        parent_trace_id: Option<String>,
        success: bool,
        duration_ms: u64,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            parent_trace_id,
            capability_id: capability_id.into(),
            success,
            error: None,
            duration_ms,
            tool_calls,
            timestamp: Utc::now(),
        }
    }
}
