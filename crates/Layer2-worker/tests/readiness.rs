//! Readiness waits against a fake container runtime

mod common;

use common::*;
use relay_foundation::Error;
use relay_worker::platform::{ContainerRuntime, ContainerSpec};
use relay_worker::{BackendKind, TaskId, Worker, WorkerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

async fn started_worker(runtime: &FakeRuntime) -> Worker {
    let id = runtime
        .create_and_start(&ContainerSpec {
            name: "relay-worker-5".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let worker = Worker::new(TaskId::new("5"), BackendKind::Container, id, "/workspace");
    worker.advance(WorkerState::Created).unwrap();
    worker
}

#[tokio::test(start_paused = true)]
async fn test_ready_before_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        ready_after: Some(Duration::from_secs(2)),
        ..FakeRuntime::ready()
    });
    let backend = container_backend(Arc::clone(&runtime), tmp.path());
    let worker = started_worker(&runtime).await;

    let start = Instant::now();
    backend
        .wait_ready(&worker, Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(worker.state(), WorkerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_carries_logs() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        ready_after: None,
        ..FakeRuntime::ready()
    });
    let backend = container_backend(Arc::clone(&runtime), tmp.path());
    let worker = started_worker(&runtime).await;

    let start = Instant::now();
    let err = backend
        .wait_ready(&worker, Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap_err();

    // Within one poll interval of the deadline
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed <= Duration::from_millis(5_500));

    match err {
        Error::ReadinessTimeout { logs, backend, .. } => {
            assert_eq!(backend, "container");
            assert_eq!(logs.as_deref(), Some("fake container logs"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(worker.state(), WorkerState::Created);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_readiness() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        ready_after: None,
        ..FakeRuntime::ready()
    });
    let backend = container_backend(Arc::clone(&runtime), tmp.path());
    let worker = started_worker(&runtime).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = backend
        .wait_ready(&worker, Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    // Cancellation still leaves the worker to be cleaned up
    assert!(backend.teardown(&worker).await.unwrap());
    assert_eq!(runtime.removed(), 1);
}
