//! RPC bridge across the isolation boundary.
//!
//! The bridge sits between a [`MessageTransport`] and an [`RpcHandler`]:
//!
//! - Inbound `rpc` envelopes are served by the handler on their own task,
//!   bounded by the RPC timeout. Each correlation id gets exactly one
//!   `rpc_response` or `rpc_error`; once answered the id is retired and any
//!   late result is discarded.
//! - Inbound `init` is answered with `init_response` and releases
//!   [`RpcBridge::wait_for_init`].
//! - Host calls made with [`RpcBridge::call`] are correlated through a
//!   pending map of oneshot senders. Responses for unknown ids are dropped.
//!
//! A transport error fails every pending host call and any handshake wait.

pub mod handler;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::protocol::{ProtocolAdapter, RpcEnvelope};
use crate::transport::MessageTransport;
use crate::{AppError, Result};

pub use handler::{HandlerFuture, RpcHandler, ToolError, ToolErrorKind};

/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default handshake timeout.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridge timeouts and handshake reply.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on each inbound call served by the handler.
    pub rpc_timeout: Duration,
    /// Bound on waiting for the isolated context's `init`.
    pub init_timeout: Duration,
    /// Result sent back in `init_response`.
    pub init_result: Value,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            init_result: json!({
                "host": "pml-mediator",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Waiting,
    Ready,
    Failed(String),
}

/// Lifecycle of an inbound correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    InFlight,
    Retired,
}

enum Inbound {
    Message(Value),
    Error(AppError),
}

type PendingCalls = Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>;

struct BridgeInner {
    transport: Arc<dyn MessageTransport>,
    adapter: Arc<dyn ProtocolAdapter>,
    handler: Arc<dyn RpcHandler>,
    config: BridgeConfig,
    pending: PendingCalls,
    calls: Mutex<HashMap<String, CallState>>,
    readiness: watch::Sender<Readiness>,
}

/// One bridge per isolated context.
pub struct RpcBridge {
    inner: Arc<BridgeInner>,
    cancel: CancellationToken,
}

impl RpcBridge {
    /// Wire the bridge to `transport` and start its dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        transport: Arc<dyn MessageTransport>,
        adapter: Arc<dyn ProtocolAdapter>,
        handler: Arc<dyn RpcHandler>,
        config: BridgeConfig,
    ) -> Self {
        let (readiness, _) = watch::channel(Readiness::Waiting);
        let inner = Arc::new(BridgeInner {
            transport,
            adapter,
            handler,
            config,
            pending: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            readiness,
        });
        let cancel = CancellationToken::new();

        let (tx, rx) = mpsc::unbounded_channel();
        let message_tx = tx.clone();
        inner.transport.on_message(Arc::new(move |value| {
            let _ = message_tx.send(Inbound::Message(value));
        }));
        inner.transport.on_error(Arc::new(move |err| {
            let _ = tx.send(Inbound::Error(err));
        }));

        let span = info_span!("rpc_bridge", transport = inner.transport.kind());
        tokio::spawn(run_dispatch(Arc::clone(&inner), rx, cancel.clone()).instrument(span));

        Self { inner, cancel }
    }

    /// Wait for the isolated context's `init`.
    ///
    /// # Errors
    ///
    /// - `AppError::Timeout("handshake …")`: no `init` within the configured
    ///   handshake timeout. Fatal for the execution.
    /// - `AppError::Transport`: the channel failed before `init` arrived.
    pub async fn wait_for_init(&self) -> Result<()> {
        let limit = self.inner.config.init_timeout;
        let mut rx = self.inner.readiness.subscribe();
        let state = tokio::time::timeout(limit, rx.wait_for(|s| *s != Readiness::Waiting))
            .await
            .map_err(|_| {
                AppError::Timeout(format!("handshake: no init received within {limit:?}"))
            })?
            .map_err(|_| AppError::Transport("bridge dropped during handshake".into()))?
            .clone();

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(AppError::Transport(format!(
                "channel failed during handshake: {reason}"
            ))),
            Readiness::Waiting => Err(AppError::Transport("handshake state lost".into())),
        }
    }

    /// Call `method` inside the isolated context and await its response.
    ///
    /// With `timeout` set, the correlation id is retired when it elapses and
    /// a late response is dropped.
    ///
    /// # Errors
    ///
    /// - `AppError::Rpc`: the context answered with `rpc_error`.
    /// - `AppError::Timeout`: no response within `timeout`.
    /// - `AppError::Transport`: the channel failed or the bridge shut down.
    pub async fn call(&self, method: &str, args: Value, timeout: Option<Duration>) -> Result<Value> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Transport("bridge is shut down".into()));
        }

        let rpc_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(rpc_id.clone(), tx);

        let envelope = RpcEnvelope::Rpc {
            id: None,
            rpc_id: rpc_id.clone(),
            method: method.to_owned(),
            args,
        };
        if let Err(err) = self.inner.send_envelope(&envelope) {
            self.inner.pending.lock().await.remove(&rpc_id);
            return Err(err);
        }
        debug!(rpc_id = %rpc_id, method, "host call sent");

        let received = match timeout {
            Some(limit) => {
                if let Ok(received) = tokio::time::timeout(limit, rx).await {
                    received
                } else {
                    self.inner.pending.lock().await.remove(&rpc_id);
                    return Err(AppError::Timeout(format!(
                        "call '{method}' not answered within {limit:?}"
                    )));
                }
            }
            None => rx.await,
        };

        received.map_err(|_| AppError::Transport("bridge closed before response".into()))?
    }

    /// Number of host calls awaiting a response.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Stop dispatching and fail every pending host call.
    ///
    /// Does not close the transport; its owner does that.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.inner.fail_pending("bridge shut down").await;
    }
}

impl Drop for RpcBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_dispatch(
    inner: Arc<BridgeInner>,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("bridge dispatch: cancellation received, stopping");
                break;
            }

            item = rx.recv() => match item {
                None => break,
                Some(Inbound::Message(value)) => inner.handle_inbound(&value).await,
                Some(Inbound::Error(err)) => {
                    warn!(error = %err, "bridge: transport error");
                    let reason = err.to_string();
                    inner.readiness.send_if_modified(|state| {
                        if *state == Readiness::Waiting {
                            *state = Readiness::Failed(reason.clone());
                            true
                        } else {
                            false
                        }
                    });
                    inner.fail_pending(&reason).await;
                }
            },
        }
    }
}

impl BridgeInner {
    fn send_envelope(&self, envelope: &RpcEnvelope) -> Result<()> {
        self.transport.send(self.adapter.to_external(envelope))
    }

    async fn handle_inbound(self: &Arc<Self>, value: &Value) {
        let Some(envelope) = self.adapter.to_internal(value) else {
            debug!("bridge: inbound message filtered by adapter");
            return;
        };

        match envelope {
            RpcEnvelope::Init { id, .. } => {
                let reply = RpcEnvelope::InitResponse {
                    id,
                    result: self.config.init_result.clone(),
                };
                if let Err(err) = self.send_envelope(&reply) {
                    warn!(error = %err, "bridge: failed to send init_response");
                }
                self.readiness.send_replace(Readiness::Ready);
                debug!("bridge: handshake complete");
            }
            RpcEnvelope::Rpc {
                id,
                rpc_id,
                method,
                args,
            } => self.dispatch_call(id, rpc_id, method, args).await,
            RpcEnvelope::RpcResponse { rpc_id, result, .. } => {
                self.resolve(&rpc_id, Ok(result)).await;
            }
            RpcEnvelope::RpcError { rpc_id, error, .. } => {
                self.resolve(&rpc_id, Err(AppError::Rpc(error.message))).await;
            }
            RpcEnvelope::InitResponse { .. } => {
                debug!("bridge: unexpected init_response ignored");
            }
            notification @ (RpcEnvelope::Notification { .. }
            | RpcEnvelope::ContextUpdate { .. }) => {
                self.handler.on_notification(notification);
            }
        }
    }

    async fn dispatch_call(
        self: &Arc<Self>,
        id: Option<Value>,
        rpc_id: String,
        method: String,
        args: Value,
    ) {
        {
            let mut calls = self.calls.lock().await;
            if calls.contains_key(&rpc_id) {
                warn!(rpc_id = %rpc_id, method = %method, "bridge: duplicate correlation id dropped");
                return;
            }
            calls.insert(rpc_id.clone(), CallState::InFlight);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let call = AssertUnwindSafe(inner.handler.handle(&method, args.clone())).catch_unwind();
            let outcome = match tokio::time::timeout(inner.config.rpc_timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(_panic)) => {
                    warn!(rpc_id = %rpc_id, method = %method, "bridge: handler panicked");
                    Err(ToolError::handler(format!("handler for '{method}' panicked")))
                }
                Err(_) => {
                    let elapsed = started.elapsed();
                    inner.handler.on_timeout(&method, &args, elapsed);
                    Err(ToolError::new(
                        ToolErrorKind::Timeout,
                        format!(
                            "call '{method}' exceeded rpc timeout of {:?}",
                            inner.config.rpc_timeout
                        ),
                    ))
                }
            };

            let reply = match outcome {
                Ok(result) => RpcEnvelope::RpcResponse {
                    id,
                    rpc_id: rpc_id.clone(),
                    result,
                },
                Err(err) => RpcEnvelope::RpcError {
                    id,
                    rpc_id: rpc_id.clone(),
                    error: err.to_body(),
                },
            };
            inner.respond(&rpc_id, &reply).await;
        });
    }

    /// Send `reply` unless `rpc_id` was already answered.
    async fn respond(&self, rpc_id: &str, reply: &RpcEnvelope) {
        {
            let mut calls = self.calls.lock().await;
            match calls.get_mut(rpc_id) {
                Some(state) if *state == CallState::InFlight => *state = CallState::Retired,
                _ => {
                    debug!(rpc_id, "bridge: correlation id already answered, reply discarded");
                    return;
                }
            }
        }
        if let Err(err) = self.send_envelope(reply) {
            warn!(rpc_id, error = %err, "bridge: failed to send reply");
        }
    }

    async fn resolve(&self, rpc_id: &str, outcome: Result<Value>) {
        let sender = self.pending.lock().await.remove(rpc_id);
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(rpc_id, "bridge: caller stopped waiting");
                }
            }
            None => debug!(rpc_id, "bridge: response for unknown correlation id dropped"),
        }
    }

    async fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (rpc_id, tx) in drained {
            debug!(rpc_id = %rpc_id, reason, "bridge: failing pending call");
            let _ = tx.send(Err(AppError::Transport(reason.to_owned())));
        }
    }
}
