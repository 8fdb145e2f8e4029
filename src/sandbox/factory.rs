//! Creation of isolated execution contexts.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::protocol::{NativeAdapter, ProtocolAdapter};
use crate::transport::{MessageTransport, WorkerTransport};
use crate::Result;

/// Boxed future returned by [`TransportFactory::create`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<dyn MessageTransport>>> + Send + 'a>>;

/// Creates one isolated context per execution.
pub trait TransportFactory: Send + Sync {
    /// Start a fresh context and return its transport.
    fn create(&self) -> TransportFuture<'_>;

    /// Adapter for the wire format the created contexts speak.
    fn adapter(&self) -> Arc<dyn ProtocolAdapter> {
        Arc::new(NativeAdapter)
    }
}

/// Spawns an out-of-process worker per execution.
#[derive(Debug, Clone)]
pub struct WorkerFactory {
    config: WorkerConfig,
    workspace_root: PathBuf,
}

impl WorkerFactory {
    /// Factory launching `config.command` inside `workspace_root`.
    #[must_use]
    pub fn new(config: WorkerConfig, workspace_root: PathBuf) -> Self {
        Self {
            config,
            workspace_root,
        }
    }
}

impl TransportFactory for WorkerFactory {
    fn create(&self) -> TransportFuture<'_> {
        Box::pin(async move {
            let worker = WorkerTransport::spawn(&self.config, &self.workspace_root)?;
            Ok(Arc::new(worker) as Arc<dyn MessageTransport>)
        })
    }
}
