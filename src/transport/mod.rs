//! Message transports to isolated execution contexts.
//!
//! A transport moves JSON values across the isolation boundary and knows
//! nothing about RPC semantics. Two implementations exist:
//!
//! - [`worker::WorkerTransport`]: out-of-process worker over NDJSON stdio.
//! - [`surface::SurfaceTransport`]: embedded UI surface over an
//!   origin-filtered `postMessage`-style window channel.

pub mod codec;
pub mod surface;
pub mod worker;

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::warn;

use crate::{AppError, Result};

pub use surface::{FrameId, FramePort, SurfaceTransport, SurfaceWindow, WindowMessage};
pub use worker::WorkerTransport;

/// Callback receiving every inbound message.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback receiving transport-level errors.
pub type ErrorHandler = Arc<dyn Fn(AppError) + Send + Sync>;

/// Byte/object-level channel to an isolated execution context.
pub trait MessageTransport: Send + Sync {
    /// Send one message to the isolated context.
    ///
    /// Sending after [`close`](Self::close) is a no-op returning `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the channel failed while open.
    fn send(&self, message: Value) -> Result<()>;

    /// Register the inbound message handler, replacing any previous one.
    ///
    /// Messages that arrived before registration are replayed in order.
    fn on_message(&self, handler: MessageHandler);

    /// Register the error handler, replacing the default warning logger.
    fn on_error(&self, handler: ErrorHandler);

    /// Release the channel. Idempotent.
    fn close(&self);

    /// Forcefully stop the isolated context.
    ///
    /// Calls in flight inside the context are orphaned: their responses will
    /// never arrive. Transports that cannot kill their peer fall back to
    /// [`close`](Self::close).
    fn terminate(&self) {
        self.close();
    }

    /// Short transport name for logs.
    fn kind(&self) -> &'static str;
}

/// Registered callbacks plus the backlog of messages awaiting a handler.
pub(crate) struct HandlerSlots {
    kind: &'static str,
    inner: Mutex<SlotState>,
}

struct SlotState {
    message: Option<MessageHandler>,
    error: Option<ErrorHandler>,
    backlog: Vec<Value>,
    /// Set while the backlog is being replayed; new messages queue behind it.
    draining: bool,
}

impl HandlerSlots {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: Mutex::new(SlotState {
                message: None,
                error: None,
                backlog: Vec::new(),
                draining: false,
            }),
        }
    }

    pub(crate) fn set_message(&self, handler: MessageHandler) {
        {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.message = Some(Arc::clone(&handler));
            state.draining = true;
        }
        loop {
            let backlog = {
                let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if state.backlog.is_empty() {
                    state.draining = false;
                    return;
                }
                std::mem::take(&mut state.backlog)
            };
            for message in backlog {
                handler(message);
            }
        }
    }

    pub(crate) fn set_error(&self, handler: ErrorHandler) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error = Some(handler);
    }

    pub(crate) fn dispatch_message(&self, message: Value) {
        let handler = {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match state.message.clone() {
                Some(handler) if !state.draining => handler,
                _ => {
                    state.backlog.push(message);
                    return;
                }
            }
        };
        handler(message);
    }

    pub(crate) fn dispatch_error(&self, error: AppError) {
        let handler = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone();
        match handler {
            Some(handler) => handler(error),
            None => warn!(transport = self.kind, %error, "transport error"),
        }
    }
}
