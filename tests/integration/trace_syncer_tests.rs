//! Trace queue ordering, batching, retries and rate limiting.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use pml_mediator::models::trace::LocalExecutionTrace;
use pml_mediator::sandbox::StaticHeaders;
use pml_mediator::trace::{SyncerConfig, TraceSyncer};
use pml_mediator::AppError;

use super::test_helpers::{dead_url, spawn_cloud, MockCloud, TraceReply};

fn trace(id: &str, parent: Option<&str>) -> LocalExecutionTrace {
    let mut trace = LocalExecutionTrace::new("fs:read", parent.map(str::to_owned), true, 3, Vec::new());
    trace.trace_id = id.to_owned();
    trace
}

fn syncer_for(url: Option<String>, batch_size: usize, max_retries: u32) -> TraceSyncer {
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", HeaderValue::from_static("test-key"));
    TraceSyncer::new(
        SyncerConfig {
            cloud_url: url,
            batch_size,
            max_retries,
            http_timeout: Duration::from_secs(5),
        },
        Arc::new(StaticHeaders(headers)),
    )
    .unwrap()
}

async fn syncer_with_cloud(batch_size: usize, max_retries: u32) -> (Arc<MockCloud>, TraceSyncer) {
    let cloud = Arc::new(MockCloud::default());
    let url = spawn_cloud(cloud.clone()).await;
    (cloud, syncer_for(Some(url), batch_size, max_retries))
}

#[tokio::test]
async fn parents_are_sent_before_children() {
    let (cloud, syncer) = syncer_with_cloud(10, 3).await;
    syncer.enqueue(trace("b", Some("a"))).unwrap();
    syncer.enqueue(trace("a", None)).unwrap();

    let report = syncer.flush().await;

    assert_eq!(report.sent, 2);
    assert_eq!(cloud.stored(), vec!["a", "b"]);
    assert_eq!(syncer.queue_len(), 0);
}

#[tokio::test]
async fn queue_is_uploaded_in_batches() {
    let (cloud, syncer) = syncer_with_cloud(2, 3).await;
    for id in ["t1", "t2", "t3", "t4", "t5"] {
        syncer.enqueue(trace(id, None)).unwrap();
    }

    let report = syncer.flush().await;

    assert_eq!(report.sent, 5);
    let attempts = cloud.trace_attempts.lock().unwrap().clone();
    assert_eq!(attempts, vec![vec!["t1", "t2"], vec!["t3", "t4"], vec!["t5"]]);
}

#[tokio::test]
async fn uploads_carry_auth_headers() {
    let (cloud, syncer) = syncer_with_cloud(10, 3).await;
    syncer.enqueue(trace("t1", None)).unwrap();
    syncer.flush().await;

    let headers = cloud.trace_headers.lock().unwrap();
    assert_eq!(headers[0].get("x-api-key").unwrap(), "test-key");
}

#[tokio::test]
async fn failed_batch_is_retried_then_dropped() {
    let (cloud, syncer) = syncer_with_cloud(10, 2).await;
    cloud.plan_traces([TraceReply::Fail(500), TraceReply::Fail(500), TraceReply::Fail(500)]);
    syncer.enqueue(trace("t1", None)).unwrap();

    let first = syncer.flush().await;
    assert_eq!((first.failed, first.dropped), (1, 0));
    assert_eq!(syncer.queue_len(), 1);

    let second = syncer.flush().await;
    assert_eq!((second.failed, second.dropped), (1, 0));

    let third = syncer.flush().await;
    assert_eq!((third.failed, third.dropped), (0, 1));
    assert_eq!(syncer.queue_len(), 0);
    assert!(cloud.stored().is_empty());
}

#[tokio::test]
async fn failed_batch_stops_the_flush_and_keeps_order() {
    let (cloud, syncer) = syncer_with_cloud(1, 3).await;
    cloud.plan_traces([TraceReply::Fail(503)]);
    syncer.enqueue(trace("a", None)).unwrap();
    syncer.enqueue(trace("b", Some("a"))).unwrap();

    let report = syncer.flush().await;
    assert_eq!(report.sent, 0);
    assert_eq!(cloud.trace_attempts.lock().unwrap().len(), 1);

    let report = syncer.flush().await;
    assert_eq!(report.sent, 2);
    assert_eq!(cloud.stored(), vec!["a", "b"]);
}

#[tokio::test]
async fn unreachable_store_counts_as_failure() {
    let syncer = syncer_for(Some(dead_url().await), 10, 3);
    syncer.enqueue(trace("t1", None)).unwrap();

    let report = syncer.flush().await;

    assert_eq!(report.failed, 1);
    assert_eq!(syncer.queue_len(), 1);
}

#[tokio::test]
async fn rate_limit_defers_the_next_flush() {
    let (cloud, syncer) = syncer_with_cloud(10, 3).await;
    cloud.plan_traces([TraceReply::RateLimited(Some(1))]);
    syncer.enqueue(trace("t1", None)).unwrap();

    let report = syncer.flush().await;
    assert!(report.deferred);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dropped, 0);
    assert_eq!(syncer.queue_len(), 1);

    let early = syncer.flush().await;
    assert!(early.deferred);
    assert_eq!(cloud.trace_attempts.lock().unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let report = syncer.flush().await;
    assert_eq!(report.sent, 1);
    assert_eq!(cloud.stored(), vec!["t1"]);
}

#[tokio::test]
async fn rate_limited_trace_is_dropped_after_retry_bound() {
    let (cloud, syncer) = syncer_with_cloud(10, 1).await;
    cloud.plan_traces([
        TraceReply::RateLimited(Some(0)),
        TraceReply::RateLimited(Some(0)),
        TraceReply::RateLimited(Some(0)),
        TraceReply::RateLimited(Some(0)),
        TraceReply::RateLimited(Some(0)),
    ]);
    syncer.enqueue(trace("t1", None)).unwrap();

    let mut dropped = 0;
    for _ in 0..5 {
        dropped += syncer.flush().await.dropped;
    }

    assert_eq!(cloud.trace_attempts.lock().unwrap().len(), 2);
    assert_eq!(dropped, 1);
    assert_eq!(syncer.queue_len(), 0);
    assert!(cloud.stored().is_empty());
}

#[tokio::test]
async fn standalone_mode_discards_traces() {
    let syncer = syncer_for(None, 10, 3);
    syncer.enqueue(trace("t1", None)).unwrap();

    assert_eq!(syncer.queue_len(), 0);
    assert_eq!(syncer.flush().await.sent, 0);
}

#[tokio::test]
async fn shutdown_flushes_and_rejects_new_traces() {
    let (cloud, syncer) = syncer_with_cloud(10, 3).await;
    syncer.enqueue(trace("t1", None)).unwrap();

    let report = syncer.shutdown().await;

    assert_eq!(report.sent, 1);
    assert_eq!(cloud.stored(), vec!["t1"]);
    assert!(!syncer.is_active());
    let err = syncer.enqueue(trace("t2", None)).unwrap_err();
    assert!(matches!(err, AppError::Sync(_)));
}
