//! Executions paused for out-of-band approval.

pub mod store;

pub use store::{PendingWorkflowStore, DEFAULT_TTL};
