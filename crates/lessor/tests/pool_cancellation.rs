//! Cancellation of blocked acquires

use std::time::Duration;

use futures::FutureExt;
use lessor::{Context, Error, Pool, PoolConfig, Resource};
use tokio_util::sync::CancellationToken;

struct Conn;

impl Resource for Conn {}

fn single_slot_pool() -> Pool<Conn> {
    Pool::with_config(
        "cancel",
        || async { Ok::<_, std::io::Error>(Conn) },
        PoolConfig {
            max_open: 1,
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn cancelled_waiter_returns_cancelled() {
    let pool = single_slot_pool();
    let held = pool.get().await.unwrap();

    let token = CancellationToken::new();
    let ctx = Context::new()
        .with_cancellation(token.clone())
        .with_metadata("request_id", "r-1");
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_context(&ctx).await.map(|lease| lease.id()) }
    });

    while pool.stats().waiting == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled { ref pool }) if pool == "cancel"));
    assert_eq!(pool.stats().waiting, 0);

    // Capacity is not leaked: the held resource still serves the next caller.
    let held_id = held.id();
    drop(held);
    let next = tokio::time::timeout(Duration::from_secs(1), pool.get())
        .await
        .expect("acquire should not hang")
        .unwrap();
    assert_eq!(next.id(), held_id);
    assert_eq!(pool.stats().open, 1);
}

#[tokio::test]
async fn already_cancelled_context_fails_fast() {
    let pool = single_slot_pool();
    let token = CancellationToken::new();
    token.cancel();
    let ctx = Context::new().with_cancellation(token);

    let result = pool.get_context(&ctx).await;
    assert!(matches!(result, Err(Error::Cancelled { .. })));
    assert_eq!(pool.stats().open, 0);
}

#[tokio::test]
async fn dropped_acquire_future_deregisters_waiter() {
    let pool = single_slot_pool();
    let held = pool.get().await.unwrap();

    let timed_out = tokio::time::timeout(Duration::from_millis(20), pool.get()).await;
    assert!(timed_out.is_err());
    assert_eq!(pool.stats().waiting, 0);

    drop(held);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn resource_delivered_to_dropped_waiter_returns_to_pool() {
    let pool = single_slot_pool();
    let held = pool.get().await.unwrap();
    let held_id = held.id();

    let mut pending = Box::pin(pool.get());
    assert!(pending.as_mut().now_or_never().is_none());
    assert_eq!(pool.stats().waiting, 1);

    // Hands the resource to the registered waiter, which never sees it.
    drop(held);
    assert_eq!(pool.stats().waiting, 0);
    drop(pending);

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.open, 1);

    let next = tokio::time::timeout(Duration::from_secs(1), pool.get())
        .await
        .expect("acquire should not hang")
        .unwrap();
    assert_eq!(next.id(), held_id);
}

#[tokio::test]
async fn cancellation_does_not_affect_other_waiters() {
    let pool = single_slot_pool();
    let held = pool.get().await.unwrap();

    let token = CancellationToken::new();
    let cancelled = tokio::spawn({
        let pool = pool.clone();
        let ctx = Context::new().with_cancellation(token.clone());
        async move { pool.get_context(&ctx).await.map(|_| ()) }
    });
    while pool.stats().waiting < 1 {
        tokio::task::yield_now().await;
    }
    let patient = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get().await.map(|lease| lease.id()) }
    });
    while pool.stats().waiting < 2 {
        tokio::task::yield_now().await;
    }

    token.cancel();
    assert!(matches!(cancelled.await.unwrap(), Err(Error::Cancelled { .. })));

    let held_id = held.id();
    drop(held);
    let served = tokio::time::timeout(Duration::from_secs(1), patient)
        .await
        .expect("remaining waiter should be served")
        .unwrap()
        .unwrap();
    assert_eq!(served, held_id);
}
