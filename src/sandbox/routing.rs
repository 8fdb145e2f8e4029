//! Per-call routing decision.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::RoutingConfig;

/// Where an intercepted call is served.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Served by the caller-supplied local handler.
    Client,
    /// Forwarded over HTTP to the remote endpoint.
    Server,
}

/// Resolves a called method to a [`Route`].
///
/// Evaluated once per call on the bridge's handler task, so implementations
/// must not block.
pub trait RoutingPolicy: Send + Sync {
    /// Route for `method`.
    fn resolve(&self, method: &str) -> Route;
}

/// Namespace-table policy built from `[routing]`.
#[derive(Debug, Clone)]
pub struct StaticRoutingPolicy {
    default_route: Route,
    client: HashSet<String>,
    server: HashSet<String>,
}

impl StaticRoutingPolicy {
    /// Build the policy from configuration.
    #[must_use]
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            default_route: config.default_route,
            client: config.client_namespaces.iter().cloned().collect(),
            server: config.server_namespaces.iter().cloned().collect(),
        }
    }

    /// Policy that routes every call to `route`.
    #[must_use]
    pub fn uniform(route: Route) -> Self {
        Self {
            default_route: route,
            client: HashSet::new(),
            server: HashSet::new(),
        }
    }
}

impl RoutingPolicy for StaticRoutingPolicy {
    fn resolve(&self, method: &str) -> Route {
        let ns = namespace(method);
        // Explicit server entries win over client entries.
        if self.server.contains(ns) {
            Route::Server
        } else if self.client.contains(ns) {
            Route::Client
        } else {
            self.default_route
        }
    }
}

/// Namespace part of a method name: `fs:read` → `fs`.
///
/// Methods without a `:` are their own namespace.
#[must_use]
pub fn namespace(method: &str) -> &str {
    method.split_once(':').map_or(method, |(ns, _)| ns)
}
