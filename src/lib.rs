#![forbid(unsafe_code)]

//! Sandboxed capability execution mediator.
//!
//! Runs semi-trusted code in an isolated context, routes every call it makes
//! to a local handler or a remote endpoint, and syncs execution traces to a
//! remote store in parent-before-child order.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod mediator;
pub mod models;
pub mod protocol;
pub mod sandbox;
pub mod session;
pub mod trace;
pub mod transport;
pub mod workflow;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
