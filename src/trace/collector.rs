//! Builds sanitized traces from execution results.

use crate::models::execution::ExecutionResult;
use crate::models::trace::{LocalExecutionTrace, ToolCallRecord};
use crate::Result;

use super::sanitize::Sanitizer;

/// Turns an [`ExecutionResult`] into a [`LocalExecutionTrace`].
#[derive(Debug, Clone)]
pub struct TraceCollector {
    sanitizer: Sanitizer,
}

impl TraceCollector {
    /// Collector with the default redaction rules.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the redaction rules fail to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            sanitizer: Sanitizer::new()?,
        })
    }

    /// Collector using `sanitizer`.
    #[must_use]
    pub fn with_sanitizer(sanitizer: Sanitizer) -> Self {
        Self { sanitizer }
    }

    /// Build the trace for one execution of `capability_id`.
    #[must_use]
    pub fn build(
        &self,
        capability_id: &str,
        parent_trace_id: Option<String>,
        result: &ExecutionResult,
    ) -> LocalExecutionTrace {
        let tool_calls = result
            .tool_calls
            .iter()
            .map(|call| self.sanitize_call(call))
            .collect();
        let mut trace = LocalExecutionTrace::new(
            capability_id,
            parent_trace_id,
            result.success,
            result.duration_ms,
            tool_calls,
        );
        trace.error = result
            .error
            .as_ref()
            .map(|err| self.sanitizer.sanitize_text(&err.message));
        trace
    }

    fn sanitize_call(&self, call: &ToolCallRecord) -> ToolCallRecord {
        ToolCallRecord {
            tool: call.tool.clone(),
            args: self.sanitizer.sanitize(&call.args),
            result: call.result.as_ref().map(|value| self.sanitizer.sanitize(value)),
            error: call
                .error
                .as_deref()
                .map(|err| self.sanitizer.sanitize_text(err)),
            success: call.success,
            duration_ms: call.duration_ms,
        }
    }
}
