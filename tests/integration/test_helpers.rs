//! Shared fixtures: a scripted isolated context and a mock remote authority.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use pml_mediator::bridge::{HandlerFuture, RpcHandler, ToolError};
use pml_mediator::protocol::RpcErrorBody;
use pml_mediator::sandbox::{TransportFactory, TransportFuture};
use pml_mediator::transport::{
    ErrorHandler, FramePort, MessageHandler, MessageTransport, SurfaceTransport, SurfaceWindow,
};
use pml_mediator::{AppError, Result};

pub const FRAME_ORIGIN: &str = "https://sandbox.test";

// ── Scripted isolated context ───────────────────────────────

/// Frame-side driver speaking native envelopes.
pub struct ContextDriver {
    port: FramePort,
    buffered: VecDeque<Value>,
    next_id: usize,
}

/// Host `execute` call received by the context.
pub struct ExecuteCall {
    pub rpc_id: String,
    pub code: String,
    pub context: Value,
}

impl ContextDriver {
    pub fn new(port: FramePort) -> Self {
        Self {
            port,
            buffered: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn post(&self, message: Value) {
        assert!(self.port.post(message), "host window gone");
    }

    /// Perform the handshake.
    pub async fn init(&mut self) -> Value {
        self.post(json!({ "type": "init", "params": { "runtime": "scripted" } }));
        let reply = self.wait_for(|m| m["type"] == "init_response").await;
        reply["result"].clone()
    }

    /// Wait for the host's `execute` call.
    pub async fn next_execute(&mut self) -> ExecuteCall {
        let msg = self
            .wait_for(|m| m["type"] == "rpc" && m["method"] == "execute")
            .await;
        ExecuteCall {
            rpc_id: msg["rpcId"].as_str().unwrap().to_owned(),
            code: msg["args"]["code"].as_str().unwrap_or_default().to_owned(),
            context: msg["args"]["context"].clone(),
        }
    }

    /// Call the host and wait for its answer.
    pub async fn call(&mut self, method: &str, args: Value) -> std::result::Result<Value, RpcErrorBody> {
        let rpc_id = self.send_call(method, args);
        self.await_reply(&rpc_id).await
    }

    /// Send a call without waiting; returns its correlation id.
    pub fn send_call(&mut self, method: &str, args: Value) -> String {
        self.next_id += 1;
        let rpc_id = format!("ctx-{}", self.next_id);
        self.post(json!({ "type": "rpc", "rpcId": rpc_id, "method": method, "args": args }));
        rpc_id
    }

    /// Wait for the reply to `rpc_id`.
    pub async fn await_reply(&mut self, rpc_id: &str) -> std::result::Result<Value, RpcErrorBody> {
        let msg = self
            .wait_for(|m| {
                (m["type"] == "rpc_response" || m["type"] == "rpc_error") && m["rpcId"] == rpc_id
            })
            .await;
        if msg["type"] == "rpc_response" {
            Ok(msg["result"].clone())
        } else {
            Err(serde_json::from_value(msg["error"].clone()).unwrap())
        }
    }

    pub fn respond(&self, rpc_id: &str, result: Value) {
        self.post(json!({ "type": "rpc_response", "rpcId": rpc_id, "result": result }));
    }

    pub fn fail(&self, rpc_id: &str, message: &str) {
        self.post(json!({
            "type": "rpc_error",
            "rpcId": rpc_id,
            "error": { "code": -1, "message": message }
        }));
    }

    /// Next message from the host, buffered ones first.
    pub async fn recv(&mut self) -> Option<Value> {
        match self.buffered.pop_front() {
            Some(msg) => Some(msg),
            None => self.port.recv().await,
        }
    }

    async fn wait_for(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.buffered.iter().position(&pred) {
            return self.buffered.remove(pos).unwrap();
        }
        loop {
            let msg = self.port.recv().await.expect("host side closed");
            if pred(&msg) {
                return msg;
            }
            self.buffered.push_back(msg);
        }
    }
}

/// Close/terminate counters shared by every context a factory created.
#[derive(Debug, Default)]
pub struct Teardown {
    pub created: AtomicUsize,
    pub closes: AtomicUsize,
    pub terminates: AtomicUsize,
}

impl Teardown {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }
}

/// Surface transport that counts teardown calls.
pub struct CountingTransport {
    inner: SurfaceTransport,
    teardown: Arc<Teardown>,
}

impl MessageTransport for CountingTransport {
    fn send(&self, message: Value) -> Result<()> {
        self.inner.send(message)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.on_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.inner.on_error(handler);
    }

    fn close(&self) {
        self.teardown.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }

    fn terminate(&self) {
        self.teardown.terminates.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

pub type Script = Arc<dyn Fn(ContextDriver) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Factory running `script` as the isolated code of every execution.
pub struct ScriptedFactory {
    script: Script,
    pub teardown: Arc<Teardown>,
    fail: bool,
}

impl ScriptedFactory {
    pub fn new<F, Fut>(script: F) -> Self
    where
        F: Fn(ContextDriver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            script: Arc::new(move |driver| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(script(driver))
            }),
            teardown: Arc::new(Teardown::default()),
            fail: false,
        }
    }

    /// Factory whose `create` always fails.
    pub fn failing() -> Self {
        let mut factory = Self::new(|_driver| async {});
        factory.fail = true;
        factory
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self) -> TransportFuture<'_> {
        Box::pin(async move {
            if self.fail {
                return Err(AppError::Transport("worker binary not found".into()));
            }
            self.teardown.created.fetch_add(1, Ordering::SeqCst);
            let (window, port) = SurfaceWindow::channel(FRAME_ORIGIN);
            let transport = CountingTransport {
                inner: SurfaceTransport::attach(window, FRAME_ORIGIN),
                teardown: Arc::clone(&self.teardown),
            };
            tokio::spawn((self.script)(ContextDriver::new(port)));
            Ok(Arc::new(transport) as Arc<dyn MessageTransport>)
        })
    }
}

// ── Local handlers ──────────────────────────────────────────

/// Local handler answering `fs:read` and failing or stalling on demand.
#[derive(Debug, Default)]
pub struct FakeTools {
    pub calls: AtomicUsize,
    pub timeouts: AtomicUsize,
}

impl RpcHandler for FakeTools {
    fn handle(&self, method: &str, args: Value) -> HandlerFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let method = method.to_owned();
        Box::pin(async move {
            match method.as_str() {
                "fs:read" => Ok(json!({ "content": format!("contents of {}", args["path"].as_str().unwrap_or("?")) })),
                "fs:slow" => {
                    tokio::time::sleep(Duration::from_millis(
                        args["ms"].as_u64().unwrap_or(1_000),
                    ))
                    .await;
                    Ok(json!("slow done"))
                }
                "fs:boom" => panic!("tool exploded"),
                other => Err(ToolError::handler(format!("unknown tool {other}"))),
            }
        })
    }

    fn on_timeout(&self, _method: &str, _args: &Value, _elapsed: Duration) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Mock remote authority ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    Valid,
    Invalid,
    NotFound,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceReply {
    Stored,
    Fail(u16),
    RateLimited(Option<u64>),
}

/// In-process stand-in for the remote authority.
pub struct MockCloud {
    pub registers: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub unregisters: AtomicUsize,
    pub register_delay: Mutex<Duration>,
    pub register_bodies: Mutex<Vec<Value>>,
    pub heartbeat_mode: Mutex<HeartbeatMode>,
    pub heartbeat_delay: Mutex<Duration>,
    pub heartbeat_interval_ms: Mutex<u64>,
    pub unregister_status: Mutex<u16>,
    pub tool_requests: Mutex<Vec<(HeaderMap, Value)>>,
    pub tool_reply: Mutex<Value>,
    pub trace_attempts: Mutex<Vec<Vec<String>>>,
    pub trace_headers: Mutex<Vec<HeaderMap>>,
    pub trace_capabilities: Mutex<Vec<String>>,
    pub stored: Mutex<Vec<String>>,
    pub trace_plan: Mutex<VecDeque<TraceReply>>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self {
            registers: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
            register_delay: Mutex::new(Duration::ZERO),
            register_bodies: Mutex::new(Vec::new()),
            heartbeat_mode: Mutex::new(HeartbeatMode::Valid),
            heartbeat_delay: Mutex::new(Duration::ZERO),
            heartbeat_interval_ms: Mutex::new(30_000),
            unregister_status: Mutex::new(200),
            tool_requests: Mutex::new(Vec::new()),
            tool_reply: Mutex::new(json!({ "jsonrpc": "2.0", "id": "1", "result": { "ok": true } })),
            trace_attempts: Mutex::new(Vec::new()),
            trace_headers: Mutex::new(Vec::new()),
            trace_capabilities: Mutex::new(Vec::new()),
            stored: Mutex::new(Vec::new()),
            trace_plan: Mutex::new(VecDeque::new()),
        }
    }
}

impl MockCloud {
    pub fn registers(&self) -> usize {
        self.registers.load(Ordering::SeqCst)
    }

    pub fn set_heartbeat(&self, mode: HeartbeatMode) {
        *self.heartbeat_mode.lock().unwrap() = mode;
    }

    pub fn plan_traces(&self, replies: impl IntoIterator<Item = TraceReply>) {
        self.trace_plan.lock().unwrap().extend(replies);
    }

    pub fn stored(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }
}

async fn register(State(cloud): State<Arc<MockCloud>>, Json(body): Json<Value>) -> Json<Value> {
    let n = cloud.registers.fetch_add(1, Ordering::SeqCst) + 1;
    cloud.register_bodies.lock().unwrap().push(body);
    let delay = *cloud.register_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let interval_ms = *cloud.heartbeat_interval_ms.lock().unwrap();
    Json(json!({
        "sessionId": format!("s{n}"),
        "heartbeatIntervalMs": interval_ms,
        "features": ["traces"],
        "scope": { "org": "alice", "project": "default" }
    }))
}

async fn heartbeat(State(cloud): State<Arc<MockCloud>>) -> Response {
    cloud.heartbeats.fetch_add(1, Ordering::SeqCst);
    let mode = *cloud.heartbeat_mode.lock().unwrap();
    let delay = *cloud.heartbeat_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    match mode {
        HeartbeatMode::Valid => Json(json!({ "valid": true })).into_response(),
        HeartbeatMode::Invalid => Json(json!({ "valid": false })).into_response(),
        HeartbeatMode::NotFound => StatusCode::NOT_FOUND.into_response(),
        HeartbeatMode::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn unregister(State(cloud): State<Arc<MockCloud>>) -> StatusCode {
    cloud.unregisters.fetch_add(1, Ordering::SeqCst);
    let status = *cloud.unregister_status.lock().unwrap();
    StatusCode::from_u16(status).unwrap()
}

async fn mcp(
    State(cloud): State<Arc<MockCloud>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    cloud.tool_requests.lock().unwrap().push((headers, body));
    Json(cloud.tool_reply.lock().unwrap().clone())
}

async fn traces(
    State(cloud): State<Arc<MockCloud>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let ids: Vec<String> = body["traces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["traceId"].as_str().unwrap().to_owned())
        .collect();
    cloud.trace_attempts.lock().unwrap().push(ids.clone());
    cloud.trace_headers.lock().unwrap().push(headers);
    cloud.trace_capabilities.lock().unwrap().extend(
        body["traces"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["capabilityId"].as_str().unwrap_or_default().to_owned()),
    );

    let reply = cloud
        .trace_plan
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(TraceReply::Stored);
    match reply {
        TraceReply::Stored => {
            let stored = ids.len();
            cloud.stored.lock().unwrap().extend(ids);
            Json(json!({ "stored": stored })).into_response()
        }
        TraceReply::Fail(code) => StatusCode::from_u16(code).unwrap().into_response(),
        TraceReply::RateLimited(Some(secs)) => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, secs.to_string())],
            "slow down",
        )
            .into_response(),
        TraceReply::RateLimited(None) => StatusCode::TOO_MANY_REQUESTS.into_response(),
    }
}

/// Serve `cloud` on an ephemeral port and return its base url.
pub async fn spawn_cloud(cloud: Arc<MockCloud>) -> String {
    let app = Router::new()
        .route("/pml/register", post(register))
        .route("/pml/heartbeat", post(heartbeat))
        .route("/pml/unregister", post(unregister))
        .route("/mcp", post(mcp))
        .route("/api/traces", post(traces))
        .with_state(cloud);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock cloud serve");
    });
    format!("http://{addr}")
}

/// Base url nothing listens on.
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}
