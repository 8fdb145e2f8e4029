//! Out-of-process worker transport.
//!
//! Spawns the worker with:
//! - `kill_on_drop(true)` so the process never outlives its transport.
//! - `env_clear()` + a safe variable allowlist so the API key and other
//!   secrets never reach semi-trusted code.
//! - NDJSON framing on stdin/stdout via [`NdjsonCodec`]; stderr is forwarded
//!   to the log at `DEBUG`.
//!
//! A reader task and a writer task share one [`CancellationToken`]; closing
//! the transport cancels both and kills the process.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{Frame, NdjsonCodec};
use super::{ErrorHandler, HandlerSlots, MessageHandler, MessageTransport};
use crate::config::WorkerConfig;
use crate::{AppError, Result};

/// Environment variables inherited by the worker process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "DENO_DIR",
];

/// Transport addressing one spawned worker process.
pub struct WorkerTransport {
    worker_id: String,
    outbound: mpsc::UnboundedSender<Value>,
    slots: Arc<HandlerSlots>,
    closed: AtomicBool,
    cancel: CancellationToken,
    child: Mutex<Option<Child>>,
}

impl WorkerTransport {
    /// Spawn a worker and start its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `AppError::Transport("failed to spawn worker: …")`: OS spawn failure.
    /// - `AppError::Transport("failed to capture worker …")`: missing pipe.
    pub fn spawn(config: &WorkerConfig, workspace_root: &Path) -> Result<Self> {
        let worker_id = uuid::Uuid::new_v4().to_string();
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("PML_WORKER_ID", &worker_id);

        cmd.current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Transport(format!("failed to spawn worker: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Transport("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Transport("failed to capture worker stdout".into()))?;
        let stderr = child.stderr.take();

        let slots = Arc::new(HandlerSlots::new("worker"));
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(
            worker_id.clone(),
            stdin,
            outbound_rx,
            Arc::clone(&slots),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(
            worker_id.clone(),
            stdout,
            Arc::clone(&slots),
            cancel.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(worker_id.clone(), stderr, cancel.clone()));
        }

        info!(worker_id, command = %config.command, "worker spawned");

        Ok(Self {
            worker_id,
            outbound,
            slots,
            closed: AtomicBool::new(false),
            cancel,
            child: Mutex::new(Some(child)),
        })
    }

    /// Identifier passed to the worker as `PML_WORKER_ID`.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether [`close`](MessageTransport::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            if let Err(err) = child.start_kill() {
                debug!(worker_id = %self.worker_id, %err, "worker already exited");
            }
        }
    }
}

impl MessageTransport for WorkerTransport {
    fn send(&self, message: Value) -> Result<()> {
        if self.is_closed() {
            debug!(worker_id = %self.worker_id, "send after close ignored");
            return Ok(());
        }
        self.outbound.send(message).map_err(|_| {
            AppError::Transport(format!("worker {} stdin closed", self.worker_id))
        })
    }

    fn on_message(&self, handler: MessageHandler) {
        self.slots.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.slots.set_error(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.kill();
        debug!(worker_id = %self.worker_id, "worker transport closed");
    }

    fn terminate(&self) {
        warn!(worker_id = %self.worker_id, "terminating worker; in-flight calls are orphaned");
        self.close();
    }

    fn kind(&self) -> &'static str {
        "worker"
    }
}

/// Write outbound envelopes onto the worker's stdin, one per line.
async fn run_writer(
    worker_id: String,
    stdin: ChildStdin,
    mut msg_rx: mpsc::UnboundedReceiver<Value>,
    slots: Arc<HandlerSlots>,
    cancel: CancellationToken,
) {
    let mut framed = FramedWrite::new(stdin, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(worker_id, "worker writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(worker_id, "worker writer: channel closed, stopping");
                    break;
                };
                if let Err(err) = framed.send(value).await {
                    slots.dispatch_error(AppError::Transport(format!("write failed: {err}")));
                    break;
                }
            }
        }
    }
}

/// Decode envelopes from the worker's stdout and dispatch them.
///
/// Malformed lines are logged and skipped. EOF or an I/O error raises a
/// transport error unless the transport is already being torn down.
pub(crate) async fn run_reader<R>(
    worker_id: String,
    stdout: R,
    slots: Arc<HandlerSlots>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(worker_id, "worker reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        if !cancel.is_cancelled() {
                            slots.dispatch_error(AppError::Transport(
                                "worker stream closed".into(),
                            ));
                        }
                        break;
                    }
                    Some(Err(AppError::Transport(ref msg))) => {
                        warn!(worker_id, error = msg.as_str(), "worker reader: framing error, skipping");
                    }
                    Some(Err(err)) => {
                        slots.dispatch_error(AppError::Transport(format!("stream error: {err}")));
                        break;
                    }
                    Some(Ok(Frame::Message(value))) => slots.dispatch_message(value),
                    Some(Ok(Frame::Malformed { line, reason })) => {
                        warn!(worker_id, error = %reason, raw_line = %line, "worker reader: malformed json, skipping");
                    }
                }
            }
        }
    }
}

async fn forward_stderr<R>(worker_id: String, stderr: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(worker_id, stderr = %line, "worker stderr"),
                Ok(None) | Err(_) => break,
            },
        }
    }
}
