//! Sandboxed execution with hybrid call routing.
//!
//! The caller-supplied local handler implements the same contract the
//! bridge uses, re-exported here as [`ToolHandler`].

pub mod executor;
pub mod factory;
pub mod remote;
pub mod routing;

pub use crate::bridge::{HandlerFuture, RpcHandler as ToolHandler, ToolError, ToolErrorKind};
pub use executor::{ExecutionOptions, ExecutorConfig, SandboxExecutor};
pub use factory::{TransportFactory, TransportFuture, WorkerFactory};
pub use remote::{HeaderSource, RemoteToolClient, StaticHeaders};
pub use routing::{Route, RoutingPolicy, StaticRoutingPolicy};
