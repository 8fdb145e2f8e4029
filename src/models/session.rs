//! Session state held by the session client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Two-level namespace a session is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    /// Organization (or user) namespace.
    pub org: String,
    /// Project namespace within the organization.
    pub project: String,
}

impl Scope {
    /// Fully-qualified dotted descriptor for `capability` within this scope.
    ///
    /// Namespace separators (`:`) in the capability name become dots, so
    /// `fs:read` in `alice/default` is `alice.default.fs.read`.
    #[must_use]
    pub fn fqdn(&self, capability: &str) -> String {
        format!(
            "{}.{}.{}",
            self.org,
            self.project,
            capability.replace(':', ".")
        )
    }
}

/// Registered session, replaced wholesale on re-registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Session identifier issued by the remote authority.
    pub session_id: String,
    /// Server-side expiry, if advertised.
    pub expires_at: Option<DateTime<Utc>>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Namespace for resources created under this session.
    pub scope: Scope,
    /// Feature flags advertised by the server.
    pub features: Vec<String>,
}

impl SessionState {
    /// Whether the advertised expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}
