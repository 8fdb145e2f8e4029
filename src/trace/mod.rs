//! Execution traces: collection, sanitization and sync.

pub mod collector;
pub mod sanitize;
pub mod syncer;

pub use collector::TraceCollector;
pub use sanitize::Sanitizer;
pub use syncer::{sort_queue_by_dependency, FlushReport, SyncerConfig, TraceSyncer};
