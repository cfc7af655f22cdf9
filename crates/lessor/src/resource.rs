//! Core resource and factory traits
//!
//! A [`Resource`] is anything expensive the pool keeps alive between uses: a
//! socket, an RPC channel, a subprocess. A [`Factory`] builds new ones on
//! demand. The pool never looks inside either; it only manages lifecycle.

use std::future::Future;

use futures::future::BoxFuture;

use crate::error::BoxError;

/// A poolable resource.
pub trait Resource: Send + 'static {
    /// Release the underlying resource for good.
    ///
    /// Called exactly once, after the last dependency on the resource is
    /// removed and never while the pool lock is held, so it may block on I/O.
    fn close(self) -> impl Future<Output = Result<(), BoxError>> + Send
    where
        Self: Sized,
    {
        async move {
            drop(self);
            Ok(())
        }
    }
}

/// Builds new resources for a pool.
///
/// Must tolerate concurrent calls: the pool does not serialize construction.
/// Implemented for every `Fn() -> impl Future<Output = Result<R, E>>` closure.
pub trait Factory: Send + Sync + 'static {
    /// The resource this factory produces.
    type Resource: Resource;

    /// Create a new resource.
    fn create(&self) -> impl Future<Output = Result<Self::Resource, BoxError>> + Send;
}

impl<F, Fut, R, E> Factory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Resource,
    E: Into<BoxError>,
{
    type Resource = R;

    async fn create(&self) -> Result<R, BoxError> {
        self().await.map_err(Into::into)
    }
}

/// Type-erased factory stored by the pool.
pub(crate) type BoxFactory<R> = Box<dyn Fn() -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync>;

/// Erase a concrete factory so `Pool<R>` is generic over the resource only.
pub(crate) fn boxed<F: Factory>(factory: F) -> BoxFactory<F::Resource> {
    let factory = std::sync::Arc::new(factory);
    Box::new(move || {
        let factory = std::sync::Arc::clone(&factory);
        Box::pin(async move { factory.create().await })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Probe {
        closed: Arc<AtomicBool>,
    }

    impl Resource for Probe {
        async fn close(self) -> Result<(), BoxError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Resource for u32 {}

    #[tokio::test]
    async fn closure_factories_are_factories() {
        let factory = boxed(|| async { Ok::<_, std::io::Error>(7_u32) });
        assert_eq!(factory().await.unwrap(), 7);

        let failing = boxed(|| async { Err::<u32, _>(std::io::Error::other("refused")) });
        assert_eq!(failing().await.unwrap_err().to_string(), "refused");
    }

    #[tokio::test]
    async fn close_hook_runs() {
        let closed = Arc::new(AtomicBool::new(false));
        Probe {
            closed: Arc::clone(&closed),
        }
        .close()
        .await
        .unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }
}
