//! Factory and close failure handling

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lessor::{BoxError, Error, Pool, PoolConfig, Resource};

#[derive(Debug)]
struct Conn;

impl Resource for Conn {}

#[tokio::test]
async fn factory_error_is_surfaced_verbatim() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let pool: Pool<Conn> = Pool::new("refusing", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Conn, _>(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")) }
    });

    let err = pool.get().await.unwrap_err();
    match &err {
        Error::Factory { pool, source } => {
            assert_eq!(pool, "refusing");
            let io = source
                .downcast_ref::<std::io::Error>()
                .expect("source should be the factory's own error");
            assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
        }
        other => panic!("expected Factory, got {other:?}"),
    }

    // Two cached-or-new attempts and one always-new attempt.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.open, 0);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn waiter_survives_background_open_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let pool = Pool::with_config(
        "flaky",
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 1 {
                    Err(std::io::Error::other("transient"))
                } else {
                    Ok(Conn)
                }
            }
        },
        PoolConfig {
            max_open: 1,
            ..Default::default()
        },
    )
    .unwrap();

    let held = pool.get().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get().await.map(|lease| lease.id()) }
    });
    while pool.stats().waiting == 0 {
        tokio::task::yield_now().await;
    }

    // Discarding the held resource frees the slot; the background open fails
    // once, and the waiter's retry opens a fresh one.
    let failure = std::io::Error::other("broken pipe");
    let broken = held.id();
    pool.put(held, Some(&failure));

    let id = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should not hang")
        .unwrap()
        .expect("retry should succeed");
    assert_ne!(id, broken);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(pool.stats().open <= 1);
}

struct Stubborn;

impl Resource for Stubborn {
    async fn close(self) -> Result<(), BoxError> {
        Err("socket already shut down".into())
    }
}

#[tokio::test]
async fn close_reports_resource_close_failure() {
    let pool = Pool::new("stubborn", || async { Ok::<_, std::io::Error>(Stubborn) });
    drop(pool.get().await.unwrap());
    assert_eq!(pool.stats().idle, 1);

    let err = pool.close().await.unwrap_err();
    assert!(matches!(err, Error::Close { .. }));
    assert_eq!(err.to_string(), "Close failed: socket already shut down");

    // The resource is still accounted as finalized.
    let stats = pool.stats();
    assert_eq!(stats.open, 0);
    assert_eq!(stats.closed, 1);
}
