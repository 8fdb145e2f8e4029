//! Batched, dependency-ordered trace upload.
//!
//! Traces are queued in memory and flushed to `POST {cloud}/api/traces` in
//! batches. Before every flush the queue is sorted so a parent trace is
//! always sent before its children; the remote store enforces that as a
//! foreign key. A failed batch goes back to the front of the queue so the
//! ordering survives retries, and a trace that keeps failing is dropped once
//! it exceeds the retry budget.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::models::trace::LocalExecutionTrace;
use crate::sandbox::HeaderSource;
use crate::{AppError, Result};

/// Deferral applied when a `429` carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Syncer settings.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Remote base URL; `None` means standalone (log and discard).
    pub cloud_url: Option<String>,
    /// Traces per POST.
    pub batch_size: usize,
    /// Failed attempts tolerated per trace.
    pub max_retries: u32,
    /// Bound on each POST.
    pub http_timeout: Duration,
}

impl SyncerConfig {
    /// Settings from `[cloud]`, `[sync]` and `[timeouts]`.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            cloud_url: config.cloud.url.clone(),
            batch_size: config.sync.batch_size,
            max_retries: config.sync.max_retries,
            http_timeout: config.timeouts.http(),
        }
    }
}

/// Outcome of one [`TraceSyncer::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Traces accepted by the remote store.
    pub sent: usize,
    /// Traces requeued after a failed batch.
    pub failed: usize,
    /// Traces discarded after exhausting their retries.
    pub dropped: usize,
    /// Whether the flush stopped on a rate-limit deferral.
    pub deferred: bool,
}

#[derive(Debug, Clone)]
struct QueuedTrace {
    trace: LocalExecutionTrace,
    retries: u32,
}

struct SyncState {
    queue: VecDeque<QueuedTrace>,
    active: bool,
    retry_after: Option<Instant>,
}

enum BatchOutcome {
    Stored,
    RateLimited(Duration),
    Failed(String),
}

#[derive(Serialize)]
struct TraceBatch<'a> {
    traces: Vec<&'a LocalExecutionTrace>,
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    #[serde(default)]
    stored: usize,
    #[serde(default)]
    errors: Vec<Value>,
}

/// Owns the trace queue; nothing else mutates it.
pub struct TraceSyncer {
    config: SyncerConfig,
    http: reqwest::Client,
    headers: Arc<dyn HeaderSource>,
    state: Mutex<SyncState>,
    flushing: tokio::sync::Mutex<()>,
}

impl TraceSyncer {
    /// Build a syncer attaching `headers` to every upload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the HTTP client cannot be built.
    pub fn new(config: SyncerConfig, headers: Arc<dyn HeaderSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| AppError::Http(format!("failed to build http client: {err}")))?;
        Ok(Self {
            config,
            http,
            headers,
            state: Mutex::new(SyncState {
                queue: VecDeque::new(),
                active: true,
                retry_after: None,
            }),
            flushing: tokio::sync::Mutex::new(()),
        })
    }

    /// Queue `trace` for upload.
    ///
    /// In standalone mode the trace is logged and discarded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` after [`shutdown`](Self::shutdown).
    pub fn enqueue(&self, trace: LocalExecutionTrace) -> Result<()> {
        if self.config.cloud_url.is_none() {
            debug!(
                trace_id = %trace.trace_id,
                capability_id = %trace.capability_id,
                success = trace.success,
                "standalone mode: trace discarded"
            );
            return Ok(());
        }

        let mut state = self.lock_state();
        if !state.active {
            warn!(trace_id = %trace.trace_id, "trace enqueued after shutdown; rejected");
            return Err(AppError::Sync("trace syncer is shut down".into()));
        }
        state.queue.push_back(QueuedTrace { trace, retries: 0 });
        Ok(())
    }

    /// Number of queued traces.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Whether the syncer still accepts traces.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    /// Upload every queued trace, parents first.
    ///
    /// Stops at the first failed batch so no child is sent ahead of a parent
    /// that is waiting for a retry.
    pub async fn flush(&self) -> FlushReport {
        let Some(base_url) = self.config.cloud_url.as_deref() else {
            return FlushReport::default();
        };
        let _flushing = self.flushing.lock().await;
        let endpoint = format!("{base_url}/api/traces");
        let mut report = FlushReport::default();

        {
            let mut state = self.lock_state();
            if let Some(until) = state.retry_after {
                if Instant::now() < until {
                    debug!(queued = state.queue.len(), "flush deferred by rate limit");
                    report.deferred = true;
                    return report;
                }
                state.retry_after = None;
            }
            sort_queue(&mut state.queue);
        }

        loop {
            let batch: Vec<QueuedTrace> = {
                let mut state = self.lock_state();
                let take = state.queue.len().min(self.config.batch_size);
                state.queue.drain(..take).collect()
            };
            if batch.is_empty() {
                break;
            }

            match self.post_batch(&endpoint, &batch).await {
                BatchOutcome::Stored => report.sent += batch.len(),
                BatchOutcome::RateLimited(wait) => {
                    warn!(?wait, batch = batch.len(), "trace store rate limited; deferring");
                    let (retry, dropped) = self.charge_retry(batch);
                    report.failed += retry.len();
                    report.dropped += dropped;
                    let mut state = self.lock_state();
                    state.retry_after = Some(Instant::now() + wait);
                    requeue_front(&mut state.queue, retry);
                    report.deferred = true;
                    break;
                }
                BatchOutcome::Failed(reason) => {
                    warn!(%reason, batch = batch.len(), "trace batch failed");
                    let (retry, dropped) = self.charge_retry(batch);
                    report.failed += retry.len();
                    report.dropped += dropped;
                    requeue_front(&mut self.lock_state().queue, retry);
                    break;
                }
            }
        }

        if report.sent > 0 || report.failed > 0 || report.dropped > 0 {
            info!(
                sent = report.sent,
                failed = report.failed,
                dropped = report.dropped,
                "trace flush finished"
            );
        }
        report
    }

    /// Stop accepting traces and make one final flush.
    pub async fn shutdown(&self) -> FlushReport {
        self.lock_state().active = false;
        let report = self.flush().await;
        let remaining = self.queue_len();
        if remaining > 0 {
            warn!(remaining, "trace syncer shut down with unsent traces");
        }
        report
    }

    async fn post_batch(&self, endpoint: &str, batch: &[QueuedTrace]) -> BatchOutcome {
        let body = TraceBatch {
            traces: batch.iter().map(|queued| &queued.trace).collect(),
        };
        let response = match self
            .http
            .post(endpoint)
            .headers(self.headers.headers())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return BatchOutcome::Failed(err.to_string()),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            return BatchOutcome::RateLimited(wait);
        }
        if !status.is_success() {
            return BatchOutcome::Failed(format!("trace store returned HTTP {status}"));
        }

        match response.json::<StoreResponse>().await {
            Ok(body) => {
                if !body.errors.is_empty() {
                    warn!(errors = ?body.errors, "trace store reported per-trace errors");
                }
                debug!(stored = body.stored, batch = batch.len(), "trace batch stored");
                BatchOutcome::Stored
            }
            Err(err) => BatchOutcome::Failed(format!("invalid trace store response: {err}")),
        }
    }

    /// Bump retry counters; returns the traces to retry and the drop count.
    fn charge_retry(&self, batch: Vec<QueuedTrace>) -> (Vec<QueuedTrace>, usize) {
        let mut retry = Vec::with_capacity(batch.len());
        let mut dropped = 0;
        for mut queued in batch {
            queued.retries += 1;
            if queued.retries > self.config.max_retries {
                warn!(
                    trace_id = %queued.trace.trace_id,
                    retries = queued.retries,
                    "trace dropped after exhausting retries"
                );
                dropped += 1;
            } else {
                retry.push(queued);
            }
        }
        (retry, dropped)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn requeue_front(queue: &mut VecDeque<QueuedTrace>, batch: Vec<QueuedTrace>) {
    for queued in batch.into_iter().rev() {
        queue.push_front(queued);
    }
}

fn sort_queue(queue: &mut VecDeque<QueuedTrace>) {
    let order = {
        let links: Vec<(&str, Option<&str>)> = queue
            .iter()
            .map(|queued| {
                (
                    queued.trace.trace_id.as_str(),
                    queued.trace.parent_trace_id.as_deref(),
                )
            })
            .collect();
        dependency_order(&links)
    };
    let mut slots: Vec<Option<QueuedTrace>> = queue.drain(..).map(Some).collect();
    queue.extend(order.into_iter().filter_map(|idx| slots[idx].take()));
}

/// Order `traces` so every parent precedes its children.
///
/// Stable: traces already in a valid order keep it. A parent that is not in
/// the slice makes its child a root. Cycles are broken by releasing the
/// earliest trace in queue order that sits on a cycle.
#[must_use]
pub fn sort_queue_by_dependency(traces: Vec<LocalExecutionTrace>) -> Vec<LocalExecutionTrace> {
    let order = {
        let links: Vec<(&str, Option<&str>)> = traces
            .iter()
            .map(|trace| (trace.trace_id.as_str(), trace.parent_trace_id.as_deref()))
            .collect();
        dependency_order(&links)
    };
    let mut slots: Vec<Option<LocalExecutionTrace>> = traces.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

/// Topological order over `(id, parent)` links, lowest queue index first.
fn dependency_order(links: &[(&str, Option<&str>)]) -> Vec<usize> {
    let count = links.len();
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(count);
    for (idx, (id, _)) in links.iter().enumerate() {
        position.entry(*id).or_insert(idx);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut parent_of: Vec<Option<usize>> = vec![None; count];
    let mut ready = BinaryHeap::new();
    for (idx, (_, parent)) in links.iter().enumerate() {
        match parent
            .and_then(|parent| position.get(parent).copied())
            .filter(|&parent| parent != idx)
        {
            Some(parent) => {
                children[parent].push(idx);
                parent_of[idx] = Some(parent);
            }
            None => ready.push(Reverse(idx)),
        }
    }

    let mut emitted = vec![false; count];
    let mut order = Vec::with_capacity(count);
    while order.len() < count {
        let idx = if let Some(Reverse(idx)) = ready.pop() {
            idx
        } else {
            // Only cycles and their descendants remain.
            match (0..count).find(|&idx| !emitted[idx] && on_cycle(&parent_of, idx)) {
                Some(idx) => idx,
                None => break,
            }
        };
        if emitted[idx] {
            continue;
        }
        emitted[idx] = true;
        order.push(idx);
        ready.extend(
            children[idx]
                .iter()
                .filter(|&&child| !emitted[child])
                .map(|&child| Reverse(child)),
        );
    }
    order
}

/// Whether following parent links from `start` leads back to it.
fn on_cycle(parent_of: &[Option<usize>], start: usize) -> bool {
    let mut current = parent_of[start];
    for _ in 0..parent_of.len() {
        match current {
            Some(idx) if idx == start => return true,
            Some(idx) => current = parent_of[idx],
            None => return false,
        }
    }
    false
}
