//! Resource pool: bounded, lease-based reuse of expensive resources.
//!
//! A [`Pool`] opens resources through a caller-supplied [`Factory`], hands
//! them out as [`Lease`]s and takes them back when the lease is dropped or
//! [`put`](Pool::put). When `max_open` is reached, acquires queue up and are
//! served oldest first as resources come back.

mod avatar;
pub mod config;
mod lease;
mod shared;
mod tasks;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::{BoxError, Error, Result};
use crate::resource::{self, Factory, Resource};

pub use avatar::AvatarId;
pub use config::PoolConfig;
pub use lease::Lease;
use shared::{Shared, Strategy};

/// Cached-or-new attempts made before falling back to a guaranteed-fresh one.
const MAX_BAD_RETRIES: usize = 2;

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Resources created and not yet finalized, plus opens in flight.
    pub open: usize,
    /// Resources parked on the free list.
    pub idle: usize,
    /// Resources currently leased out.
    pub in_use: usize,
    /// Acquires blocked waiting for capacity.
    pub waiting: usize,
    /// Total resources ever finalized.
    pub closed: u64,
}

/// Generic resource pool.
///
/// Cheap to clone; every clone refers to the same pool.
pub struct Pool<R: Resource> {
    shared: Arc<Shared<R>>,
}

impl<R: Resource> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Resource> Pool<R> {
    /// Create a pool with the default configuration: unlimited open
    /// resources, up to two idle ones, no lifetime limit.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Factory<Resource = R>,
    {
        Self::build(name.into(), factory, PoolConfig::default())
    }

    /// Create a pool with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_config<F>(name: impl Into<String>, factory: F, config: PoolConfig) -> Result<Self>
    where
        F: Factory<Resource = R>,
    {
        config.validate()?;
        Ok(Self::build(name.into(), factory, config))
    }

    fn build<F>(name: String, factory: F, config: PoolConfig) -> Self
    where
        F: Factory<Resource = R>,
    {
        tracing::debug!(
            pool = %name,
            max_open = config.max_open,
            max_idle = config.idle_limit(),
            max_lifetime = ?config.max_lifetime,
            "creating pool"
        );
        Self {
            shared: Shared::start(name, resource::boxed(factory), config),
        }
    }

    /// The pool's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Acquire a resource, waiting without limit if the pool is at capacity.
    pub async fn get(&self) -> Result<Lease<R>> {
        self.get_context(&Context::new()).await
    }

    /// Acquire a resource, giving up when `ctx` is cancelled.
    ///
    /// Expired resources and factory failures are retried: up to two attempts
    /// that may reuse an idle resource, then one that always opens a new one.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is or becomes closed
    /// - [`Error::Cancelled`] if `ctx` is cancelled before a resource arrives
    /// - [`Error::Factory`] with the factory's own error as its source
    pub async fn get_context(&self, ctx: &Context) -> Result<Lease<R>> {
        for attempt in 0..MAX_BAD_RETRIES {
            match self.shared.acquire(Strategy::CachedOrNew, ctx).await {
                Err(err) if err.is_retryable() => {
                    tracing::trace!(pool = %self.name(), attempt, error = %err, "retrying acquire");
                }
                other => return other,
            }
        }
        self.shared.acquire(Strategy::AlwaysNew, ctx).await
    }

    /// Return a leased resource.
    ///
    /// With `err` set the resource is considered broken: it is closed and
    /// never handed out again. Without one this is the same as dropping the
    /// lease.
    pub fn put(&self, lease: Lease<R>, err: Option<&dyn std::error::Error>) {
        if let Some(err) = err {
            tracing::debug!(pool = %self.name(), avatar = %lease.id(), error = %err, "discarding broken resource");
        }
        lease.release(err.is_some());
    }

    /// Acquire a resource, run `f` on it and return it to the pool.
    ///
    /// If `f` fails or panics the resource is discarded.
    pub async fn callback<F, T, E>(&self, f: F) -> Result<T>
    where
        F: for<'r> FnOnce(&'r mut R) -> BoxFuture<'r, std::result::Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        self.callback_context(&Context::new(), f).await
    }

    /// [`callback`](Self::callback) with a cancellable acquire.
    pub async fn callback_context<F, T, E>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: for<'r> FnOnce(&'r mut R) -> BoxFuture<'r, std::result::Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        let mut lease = self.get_context(ctx).await?;
        let resource: &mut R = &mut lease;
        let outcome = AssertUnwindSafe(async move { f(resource).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => {
                drop(lease);
                Ok(value)
            }
            Ok(Err(err)) => {
                lease.release(true);
                Err(Error::Callback { source: err.into() })
            }
            Err(payload) => {
                let err = Error::panicked(payload);
                tracing::warn!(pool = %self.name(), error = %err, "callback panicked");
                lease.release(true);
                Err(err)
            }
        }
    }

    /// Limit how many idle resources are kept. `0` keeps none.
    ///
    /// Capped at `max_open`; surplus idle resources are closed.
    pub fn set_max_idle(&self, n: usize) {
        self.shared.set_max_idle(n);
    }

    /// Limit how many resources may be open at once. `0` means unlimited.
    ///
    /// Lowers the idle limit when it would exceed the new cap.
    pub fn set_max_open(&self, n: usize) {
        self.shared.set_max_open(n);
    }

    /// Limit how long a resource may be reused after creation.
    /// [`Duration::ZERO`] means forever.
    pub fn set_max_lifetime(&self, d: Duration) {
        self.shared.set_max_lifetime(d);
    }

    /// Close the pool.
    ///
    /// Blocked acquires fail with [`Error::PoolClosed`] and idle resources are
    /// closed. Leased resources are closed as they come back. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the last [`Error::Close`] raised while closing idle resources.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    /// Snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl<R: Resource> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("stats", &self.stats())
            .finish()
    }
}
