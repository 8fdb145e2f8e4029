//! Worker transport against real child processes.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use pml_mediator::config::WorkerConfig;
use pml_mediator::transport::{MessageTransport, WorkerTransport};
use pml_mediator::AppError;

fn worker(command: &str, args: &[&str]) -> WorkerTransport {
    let config = WorkerConfig {
        command: command.into(),
        args: args.iter().map(|a| (*a).to_owned()).collect(),
    };
    WorkerTransport::spawn(&config, &std::env::temp_dir()).expect("spawn worker")
}

fn collect_messages(transport: &WorkerTransport) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on_message(Arc::new(move |value| {
        let _ = tx.send(value);
    }));
    rx
}

fn collect_errors(transport: &WorkerTransport) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on_error(Arc::new(move |err: AppError| {
        let _ = tx.send(err.to_string());
    }));
    rx
}

#[tokio::test]
async fn messages_round_trip_through_the_worker() {
    let transport = worker("cat", &[]);
    let mut rx = collect_messages(&transport);

    transport.send(json!({ "type": "init" })).unwrap();
    transport
        .send(json!({ "type": "rpc_response", "rpcId": "r1", "result": [1, 2] }))
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first["type"], "init");
    assert_eq!(second["rpcId"], "r1");

    transport.close();
}

#[tokio::test]
async fn close_is_idempotent_and_later_sends_are_ignored() {
    let transport = worker("cat", &[]);
    let mut errors = collect_errors(&transport);

    transport.close();
    transport.close();
    transport.terminate();

    assert!(transport.is_closed());
    assert!(transport.send(json!({ "type": "init" })).is_ok());
    // A closed transport does not report its own shutdown as a failure.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn worker_exit_is_reported_as_transport_error() {
    let transport = worker("sh", &["-c", "sleep 0.2"]);
    let mut errors = collect_errors(&transport);

    let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err, "transport: worker stream closed");
}

#[tokio::test]
async fn worker_env_excludes_secrets() {
    std::env::set_var("PML_API_KEY", "should-not-leak");
    let transport = worker("sh", &["-c", "printf '{\"key\":\"%s\",\"id\":\"%s\"}\\n' \"$PML_API_KEY\" \"$PML_WORKER_ID\""]);
    let mut rx = collect_messages(&transport);

    let value = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(value["key"], "");
    assert_eq!(value["id"], transport.worker_id());
    transport.close();
}

#[tokio::test]
async fn missing_binary_fails_to_spawn() {
    let config = WorkerConfig {
        command: "/nonexistent/pml-worker".into(),
        args: Vec::new(),
    };
    let err = WorkerTransport::spawn(&config, &std::env::temp_dir())
        .err()
        .expect("spawn should fail");
    assert!(matches!(err, AppError::Transport(_)));
}
