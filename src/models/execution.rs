//! Execution outcome returned by the sandbox executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::trace::ToolCallRecord;
use super::workflow::ApprovalRequest;

/// Classification of an execution-level failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The whole-execution deadline elapsed; the context was terminated.
    Timeout,
    /// The isolated context never completed the `init` handshake.
    Handshake,
    /// The isolated context could not be created or its channel failed.
    Transport,
    /// The isolated code itself raised an error.
    Runtime,
    /// A call needs out-of-band approval before the code can proceed.
    ApprovalRequired,
}

/// Structured execution error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Failure classification.
    pub kind: ExecutionErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl ExecutionError {
    /// Build an error of `kind` with `message`.
    #[must_use]
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of one sandboxed execution.
///
/// Callers only need `success` plus `value` or `error` to report an outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the code completed without error.
    pub success: bool,
    /// Value returned by the code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Calls made by the code, ordered by completion time.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Total execution time in milliseconds.
    pub duration_ms: u64,
    /// First approval request raised by a call, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
}

impl ExecutionResult {
    /// Successful result carrying `value`.
    #[must_use]
    pub fn ok(value: Value, tool_calls: Vec<ToolCallRecord>, duration_ms: u64) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            tool_calls,
            duration_ms,
            approval: None,
        }
    }

    /// Failed result carrying `error`.
    #[must_use]
    pub fn failed(
        error: ExecutionError,
        tool_calls: Vec<ToolCallRecord>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            tool_calls,
            duration_ms,
            approval: None,
        }
    }

    /// Error kind, if the execution failed.
    #[must_use]
    pub fn error_kind(&self) -> Option<ExecutionErrorKind> {
        self.error.as_ref().map(|err| err.kind)
    }
}
