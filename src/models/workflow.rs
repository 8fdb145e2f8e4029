//! Approval requests and paused workflows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why an execution was paused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ApprovalKind {
    /// A capability dependency must be installed first.
    #[serde(rename = "dependency")]
    DependencyInstall,
    /// A credential (API key) is missing for the called capability.
    #[serde(rename = "api_key_required")]
    MissingCredential,
    /// A capability's content hash no longer matches the pinned one.
    #[serde(rename = "integrity")]
    IntegrityMismatch,
}

impl ApprovalKind {
    /// Parse the wire name used in `approvalType`.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "dependency" => Some(Self::DependencyInstall),
            "api_key_required" => Some(Self::MissingCredential),
            "integrity" => Some(Self::IntegrityMismatch),
            _ => None,
        }
    }

    /// Wire name used in `approvalType`.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::DependencyInstall => "dependency",
            Self::MissingCredential => "api_key_required",
            Self::IntegrityMismatch => "integrity",
        }
    }
}

/// Approval raised by a single call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Approval classification.
    pub kind: ApprovalKind,
    /// Method whose call raised the approval.
    pub method: String,
    /// Kind-specific details (dependency name, credential name, hashes).
    pub payload: Value,
}

/// Approval granted by the operator, attached to the resumed execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalGrant {
    /// Workflow being resumed.
    pub workflow_id: String,
    /// Approval classification.
    pub kind: ApprovalKind,
    /// Method the grant applies to.
    pub method: String,
    /// Payload echoed from the original request.
    pub payload: Value,
}

/// An execution paused until an out-of-band approval arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingWorkflow {
    /// Original code submitted for execution.
    pub code: String,
    /// Original context object.
    pub context: Value,
    /// Capability the execution ran for.
    pub capability_id: String,
    /// Parent trace of the original execution.
    pub parent_trace_id: Option<String>,
    /// Method whose call triggered the pause.
    pub method: String,
    /// Approval classification.
    pub kind: ApprovalKind,
    /// Kind-specific payload.
    pub payload: Value,
    /// Creation timestamp; the TTL is measured from here.
    pub created_at: DateTime<Utc>,
}
