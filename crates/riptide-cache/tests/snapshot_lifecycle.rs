mod common;

use bytes::Bytes;
use common::*;
use riptide_cache::CacheError;
use std::time::Duration;

#[tokio::test]
async fn waiters_resolve_when_the_snapshot_starts() {
    let (source, gate) = ScriptedSource::gated(
        10,
        vec![Bytes::from_static(b"{\"id\":\"1\",\"value\":\"v\"}")],
    );
    let harness = start_cache(source).await;
    let (handle, _) = harness
        .cache
        .get_or_create_shape_handle(items_shape())
        .await
        .expect("create");

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let cache = harness.cache.clone();
        let handle = handle.clone();
        waiters.push(tokio::spawn(async move {
            cache.await_snapshot_start(&handle).await
        }));
    }
    // Let the waiters enqueue with the consumer before the source opens.
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.send(true).expect("open gate");

    for waiter in waiters {
        waiter.await.expect("join").expect("snapshot started");
    }

    // A wait issued after the transition resolves immediately.
    harness
        .cache
        .await_snapshot_start(&handle)
        .await
        .expect("already started");
}

#[tokio::test]
async fn snapshot_failure_reaches_every_listener() {
    let (source, gate) = ScriptedSource::failing_gated("expected error");
    let harness = start_cache(source).await;
    let (handle, _) = harness
        .cache
        .get_or_create_shape_handle(items_shape())
        .await
        .expect("create");

    let mut listeners = Vec::new();
    for _ in 0..10 {
        let cache = harness.cache.clone();
        let handle = handle.clone();
        listeners.push(tokio::spawn(async move {
            cache.await_snapshot_start(&handle).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.send(true).expect("open gate");

    for listener in listeners {
        let result = listener.await.expect("join");
        match result {
            Err(CacheError::SnapshotFailed(message)) => {
                assert!(message.contains("expected error"), "got: {message}");
            }
            other => panic!("expected snapshot failure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn failed_shapes_become_unreachable_and_rotate() {
    let source = ScriptedSource::failing("expected error");
    let harness = start_cache(source.clone()).await;
    let (handle, _) = harness
        .cache
        .get_or_create_shape_handle(items_shape())
        .await
        .expect("create");

    // The coordinator erases the handle once the failure is reported.
    let cache = harness.cache.clone();
    let probe = handle.clone();
    wait_until("failed handle to be erased", || {
        let cache = cache.clone();
        let probe = probe.clone();
        async move { !cache.has_shape(&probe).await }
    })
    .await;

    // An equivalent shape gets a fresh handle (and a fresh snapshot try).
    let (rotated, _) = harness
        .cache
        .get_or_create_shape_handle(items_shape())
        .await
        .expect("recreate");
    assert_ne!(rotated, handle);
    wait_until("second snapshot attempt", || async { source.opens() >= 2 }).await;
}
