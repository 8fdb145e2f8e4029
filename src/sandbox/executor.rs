//! Sandbox executor: one isolated context per execution.
//!
//! ```text
//! execute(code, context, local_handler)
//!   ├─ factory.create()            → transport (guarded)
//!   ├─ RpcBridge::start(…, RoutingHandler)
//!   ├─ wait_for_init()             ┐
//!   ├─ call("execute", {code, ctx}) ┘ bounded by the execution timeout
//!   └─ bridge.shutdown(); guard releases transport exactly once
//! ```
//!
//! Every call the isolated code makes lands in [`RoutingHandler`], which
//! resolves a [`Route`] and serves it locally or remotely, recording a
//! [`ToolCallRecord`] as the call completes.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::factory::TransportFactory;
use super::remote::{approval_request, RemoteToolClient};
use super::routing::{Route, RoutingPolicy};
use crate::bridge::{BridgeConfig, HandlerFuture, RpcBridge, RpcHandler, ToolError};
use crate::config::GlobalConfig;
use crate::models::execution::{ExecutionError, ExecutionErrorKind, ExecutionResult};
use crate::models::trace::ToolCallRecord;
use crate::models::workflow::{ApprovalGrant, ApprovalRequest};
use crate::protocol::RpcEnvelope;
use crate::transport::MessageTransport;
use crate::AppError;

/// Default whole-execution timeout.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Method the host calls to run code inside the context.
pub const EXECUTE_METHOD: &str = "execute";

/// Executor timeouts.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bridge settings (per-call RPC timeout, handshake timeout).
    pub bridge: BridgeConfig,
    /// Bound on one whole execution, independent of per-call timeouts.
    pub execution_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    /// Timeouts from `[timeouts]`.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            bridge: BridgeConfig {
                rpc_timeout: config.timeouts.rpc(),
                init_timeout: config.timeouts.init(),
                ..BridgeConfig::default()
            },
            execution_timeout: config.timeouts.execution(),
        }
    }
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Approval granted for a resumed workflow; attached to matching
    /// server-routed calls as `_meta.approval`.
    pub grant: Option<ApprovalGrant>,
}

/// Runs code in isolated contexts and routes their calls.
pub struct SandboxExecutor {
    config: ExecutorConfig,
    factory: Arc<dyn TransportFactory>,
    policy: Arc<dyn RoutingPolicy>,
    remote: Option<Arc<RemoteToolClient>>,
}

impl SandboxExecutor {
    /// Build an executor. Without `remote`, server-routed calls fail with a
    /// configuration error (standalone mode).
    #[must_use]
    pub fn new(
        config: ExecutorConfig,
        factory: Arc<dyn TransportFactory>,
        policy: Arc<dyn RoutingPolicy>,
        remote: Option<RemoteToolClient>,
    ) -> Self {
        Self {
            config,
            factory,
            policy,
            remote: remote.map(Arc::new),
        }
    }

    /// Execute `code` with `context`.
    ///
    /// Never fails: every failure is reported in the returned result.
    pub async fn execute(
        &self,
        code: &str,
        context: Value,
        local_handler: Option<Arc<dyn RpcHandler>>,
    ) -> ExecutionResult {
        self.execute_with(code, context, local_handler, ExecutionOptions::default())
            .await
    }

    /// [`execute`](Self::execute) with explicit options.
    pub async fn execute_with(
        &self,
        code: &str,
        context: Value,
        local_handler: Option<Arc<dyn RpcHandler>>,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("execute", execution_id = %execution_id);
        self.run(code, context, local_handler, options)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        code: &str,
        context: Value,
        local_handler: Option<Arc<dyn RpcHandler>>,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let started = Instant::now();

        let transport = match self.factory.create().await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(%err, "failed to create isolated context");
                return ExecutionResult::failed(
                    ExecutionError::new(ExecutionErrorKind::Transport, err.to_string()),
                    Vec::new(),
                    elapsed_ms(started),
                );
            }
        };
        let guard = TransportGuard::new(Arc::clone(&transport));

        let router = Arc::new(RoutingHandler {
            policy: Arc::clone(&self.policy),
            local: local_handler,
            remote: self.remote.clone(),
            grant: options.grant,
            records: Mutex::new(Vec::new()),
            approval: Mutex::new(None),
        });
        let bridge = RpcBridge::start(
            transport,
            self.factory.adapter(),
            Arc::clone(&router) as Arc<dyn RpcHandler>,
            self.config.bridge.clone(),
        );

        let limit = self.config.execution_timeout;
        let outcome = tokio::time::timeout(limit, drive(&bridge, code, context)).await;
        bridge.shutdown().await;

        let tool_calls = router.take_records();
        let duration_ms = elapsed_ms(started);
        let mut result = match outcome {
            Err(_) => {
                warn!(?limit, "execution timed out; terminating isolated context");
                guard.terminate();
                ExecutionResult::failed(
                    ExecutionError::new(
                        ExecutionErrorKind::Timeout,
                        format!("execution exceeded {limit:?}"),
                    ),
                    tool_calls,
                    duration_ms,
                )
            }
            Ok(Ok(value)) => ExecutionResult::ok(value, tool_calls, duration_ms),
            Ok(Err(failure)) => {
                ExecutionResult::failed(failure.into_error(), tool_calls, duration_ms)
            }
        };
        guard.release();

        if let Some(request) = router.take_approval() {
            info!(method = %request.method, kind = ?request.kind, "execution paused for approval");
            result.success = false;
            result.value = None;
            result.error = Some(ExecutionError::new(
                ExecutionErrorKind::ApprovalRequired,
                format!("call '{}' requires approval", request.method),
            ));
            result.approval = Some(request);
        }

        debug!(
            success = result.success,
            calls = result.tool_calls.len(),
            duration_ms = result.duration_ms,
            "execution finished"
        );
        result
    }
}

enum Failure {
    Handshake(AppError),
    Call(AppError),
}

impl Failure {
    fn into_error(self) -> ExecutionError {
        match self {
            Self::Handshake(err) => {
                ExecutionError::new(ExecutionErrorKind::Handshake, err.to_string())
            }
            Self::Call(AppError::Rpc(message)) => {
                ExecutionError::new(ExecutionErrorKind::Runtime, message)
            }
            Self::Call(err @ AppError::Timeout(_)) => {
                ExecutionError::new(ExecutionErrorKind::Timeout, err.to_string())
            }
            Self::Call(err) => ExecutionError::new(ExecutionErrorKind::Transport, err.to_string()),
        }
    }
}

async fn drive(bridge: &RpcBridge, code: &str, context: Value) -> Result<Value, Failure> {
    bridge.wait_for_init().await.map_err(Failure::Handshake)?;
    bridge
        .call(EXECUTE_METHOD, json!({ "code": code, "context": context }), None)
        .await
        .map_err(Failure::Call)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Releases the transport exactly once, on every exit path.
struct TransportGuard {
    transport: Arc<dyn MessageTransport>,
    released: AtomicBool,
}

impl TransportGuard {
    fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.transport.close();
        }
    }

    fn terminate(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.transport.terminate();
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bridge handler applying the routing policy to each intercepted call.
struct RoutingHandler {
    policy: Arc<dyn RoutingPolicy>,
    local: Option<Arc<dyn RpcHandler>>,
    remote: Option<Arc<RemoteToolClient>>,
    grant: Option<ApprovalGrant>,
    records: Mutex<Vec<ToolCallRecord>>,
    approval: Mutex<Option<ApprovalRequest>>,
}

impl RoutingHandler {
    async fn route(&self, method: &str, args: Value) -> Result<Value, ToolError> {
        match self.policy.resolve(method) {
            Route::Client => {
                let Some(local) = &self.local else {
                    return Err(ToolError::configuration(format!(
                        "no local handler supplied for client-routed method '{method}'"
                    )));
                };
                AssertUnwindSafe(local.handle(method, args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(ToolError::handler(format!("local handler for '{method}' panicked")))
                    })
            }
            Route::Server => {
                let Some(remote) = &self.remote else {
                    return Err(ToolError::configuration(format!(
                        "no remote endpoint configured for server-routed method '{method}'"
                    )));
                };
                let meta = self
                    .grant
                    .as_ref()
                    .filter(|grant| grant.method == method)
                    .map(|grant| json!({ "approval": grant }));
                remote.call(method, args, meta).await
            }
        }
    }

    fn record(&self, record: ToolCallRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn capture_approval(&self, error: &ToolError) {
        let Some(request) = approval_request(error) else {
            return;
        };
        let mut slot = self.approval.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(request);
        }
    }

    fn take_records(&self) -> Vec<ToolCallRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn take_approval(&self) -> Option<ApprovalRequest> {
        self.approval
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl RpcHandler for RoutingHandler {
    fn handle(&self, method: &str, args: Value) -> HandlerFuture<'_> {
        let method = method.to_owned();
        Box::pin(async move {
            let started = Instant::now();
            let outcome = self.route(&method, args.clone()).await;
            let duration_ms = elapsed_ms(started);
            match &outcome {
                Ok(result) => {
                    self.record(ToolCallRecord::succeeded(
                        &method,
                        args,
                        result.clone(),
                        duration_ms,
                    ));
                }
                Err(err) => {
                    debug!(method = %method, %err, "call failed");
                    self.capture_approval(err);
                    self.record(ToolCallRecord::failed(&method, args, err.to_string(), duration_ms));
                }
            }
            outcome
        })
    }

    fn on_timeout(&self, method: &str, args: &Value, elapsed: Duration) {
        warn!(method, ?elapsed, "call exceeded rpc timeout");
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.record(ToolCallRecord::failed(
            method,
            args.clone(),
            "timeout: call exceeded rpc timeout",
            duration_ms,
        ));
        if self.policy.resolve(method) == Route::Client {
            if let Some(local) = &self.local {
                local.on_timeout(method, args, elapsed);
            }
        }
    }

    fn on_notification(&self, envelope: RpcEnvelope) {
        match &self.local {
            Some(local) => local.on_notification(envelope),
            None => debug!(kind = envelope.kind(), "notification without local handler ignored"),
        }
    }
}
