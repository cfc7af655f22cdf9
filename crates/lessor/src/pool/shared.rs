//! Shared pool state and the acquire/release protocol.
//!
//! All bookkeeping lives in [`State`] behind a single lock. The lock is never
//! held across an `.await`: factory calls and resource finalization always run
//! after it has been released.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot};

use super::avatar::{Avatar, AvatarId};
use super::config::PoolConfig;
use super::lease::Lease;
use super::tasks;
use super::PoolStats;
use crate::context::Context;
use crate::dependency::{DependencyTracker, Removal};
use crate::error::{Error, Result};
use crate::resource::{BoxFactory, Resource};

/// What a waiter receives: a leased avatar, or the error a background open
/// ran into on its behalf.
pub(crate) type Delivery<R> = std::result::Result<Avatar<R>, Error>;

/// How [`Shared::acquire`] may satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Prefer the most recently freed resource, else open or wait.
    CachedOrNew,
    /// Skip the free list entirely.
    AlwaysNew,
}

/// Bookkeeping guarded by the pool lock.
pub(crate) struct State<R> {
    pub(crate) config: PoolConfig,
    /// Idle avatars, most recently freed last.
    free: Vec<Avatar<R>>,
    /// Blocked acquires, keyed by registration order.
    requests: BTreeMap<u64, oneshot::Sender<Delivery<R>>>,
    next_request: u64,
    next_avatar: u64,
    /// Created and not yet finalized, plus slots reserved for pending opens.
    num_open: usize,
    leased: HashSet<AvatarId>,
    deps: DependencyTracker<AvatarId, AvatarId>,
    closed: bool,
    /// Feeds the opener task; dropped on close.
    opener: Option<mpsc::UnboundedSender<()>>,
    /// Wakes the cleaner task while one is running.
    cleaner: Option<Arc<Notify>>,
}

impl<R> State<R> {
    fn at_capacity(&self) -> bool {
        self.config.max_open > 0 && self.num_open >= self.config.max_open
    }

    fn new_avatar(&mut self, resource: R) -> Avatar<R> {
        let id = AvatarId(self.next_avatar);
        self.next_avatar += 1;
        self.deps.add_dep(id, id);
        Avatar::new(id, resource)
    }

    /// Ask the opener for one resource per blocked acquire, within `max_open`.
    fn maybe_open_new(&mut self) {
        let mut wanted = self.requests.len();
        if self.config.max_open > 0 {
            wanted = wanted.min(self.config.max_open.saturating_sub(self.num_open));
        }
        let Some(opener) = self.opener.as_ref() else {
            return;
        };
        for _ in 0..wanted {
            if opener.send(()).is_err() {
                return;
            }
            self.num_open += 1;
        }
    }
}

/// Next step of an acquire, decided under the lock.
enum Next<R> {
    Reuse(Avatar<R>, Option<Duration>),
    Wait(u64, oneshot::Receiver<Delivery<R>>, Option<Duration>),
    Open,
}

/// State shared by every handle to one pool.
pub(crate) struct Shared<R: Resource> {
    name: String,
    factory: BoxFactory<R>,
    num_closed: AtomicU64,
    state: Mutex<State<R>>,
}

impl<R: Resource> Shared<R> {
    /// Build the shared state and spawn its opener task.
    ///
    /// Must be called inside a Tokio runtime.
    pub(crate) fn start(name: String, factory: BoxFactory<R>, config: PoolConfig) -> Arc<Self> {
        let (opener, requests) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            name,
            factory,
            num_closed: AtomicU64::new(0),
            state: Mutex::new(State {
                config,
                free: Vec::new(),
                requests: BTreeMap::new(),
                next_request: 0,
                next_avatar: 0,
                num_open: 0,
                leased: HashSet::new(),
                deps: DependencyTracker::new(),
                closed: false,
                opener: Some(opener),
                cleaner: None,
            }),
        });
        tokio::spawn(tasks::run_opener(Arc::downgrade(&shared), requests));
        shared
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            open: state.num_open,
            idle: state.free.len(),
            in_use: state.leased.len(),
            waiting: state.requests.len(),
            closed: self.num_closed.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// One acquire attempt. May fail with `Expired`, which callers retry.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        strategy: Strategy,
        ctx: &Context,
    ) -> Result<Lease<R>> {
        let next = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::pool_closed(&self.name));
            }
            if ctx.is_cancelled() {
                return Err(Error::cancelled(&self.name));
            }
            let lifetime = state.config.max_lifetime;

            if strategy == Strategy::CachedOrNew
                && let Some(avatar) = state.free.pop()
            {
                state.leased.insert(avatar.id);
                Next::Reuse(avatar, lifetime)
            } else if state.at_capacity() {
                let key = state.next_request;
                state.next_request += 1;
                let (tx, rx) = oneshot::channel();
                state.requests.insert(key, tx);
                Next::Wait(key, rx, lifetime)
            } else {
                // Reserve the slot before dialing so concurrent acquires
                // cannot overshoot max_open.
                state.num_open += 1;
                Next::Open
            }
        };

        match next {
            Next::Reuse(avatar, lifetime) => self.check_lifetime(avatar, lifetime),
            Next::Wait(key, rx, lifetime) => self.wait(key, rx, lifetime, ctx).await,
            Next::Open => self.open_for_caller().await,
        }
    }

    /// An expired avatar is closed off the caller's future, so dropping the
    /// acquire cannot strand its slot.
    fn check_lifetime(
        self: &Arc<Self>,
        avatar: Avatar<R>,
        lifetime: Option<Duration>,
    ) -> Result<Lease<R>> {
        if avatar.expired(lifetime) {
            tracing::debug!(pool = %self.name, avatar = %avatar.id, "discarding expired resource");
            self.close_detached(avatar);
            return Err(Error::expired(&self.name));
        }
        Ok(Lease::new(avatar, Arc::clone(self)))
    }

    async fn wait(
        self: &Arc<Self>,
        key: u64,
        rx: oneshot::Receiver<Delivery<R>>,
        lifetime: Option<Duration>,
        ctx: &Context,
    ) -> Result<Lease<R>> {
        tracing::trace!(
            pool = %self.name,
            request = key,
            metadata = ?ctx.metadata,
            "pool at capacity, waiting for a resource"
        );
        let mut waiter = Waiter {
            shared: self,
            key,
            rx,
            settled: false,
        };

        let delivered = tokio::select! {
            delivered = &mut waiter.rx => delivered,
            () = ctx.cancellation.cancelled() => {
                tracing::debug!(pool = %self.name, request = key, "acquire cancelled while waiting");
                return Err(Error::cancelled(&self.name));
            }
        };
        // Whoever completed the channel already removed the request.
        waiter.settled = true;

        match delivered {
            Err(_) => Err(Error::pool_closed(&self.name)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(avatar)) => self.check_lifetime(avatar, lifetime),
        }
    }

    async fn open_for_caller(self: &Arc<Self>) -> Result<Lease<R>> {
        let slot = ReservedSlot {
            shared: self,
            armed: true,
        };
        match (self.factory)().await {
            Err(source) => {
                drop(slot);
                tracing::debug!(pool = %self.name, error = %source, "factory failed");
                Err(Error::factory(&self.name, source))
            }
            Ok(resource) => {
                slot.disarm();
                let avatar = {
                    let mut state = self.state.lock();
                    let avatar = state.new_avatar(resource);
                    state.leased.insert(avatar.id);
                    avatar
                };
                tracing::trace!(pool = %self.name, avatar = %avatar.id, "opened resource");
                Ok(Lease::new(avatar, Arc::clone(self)))
            }
        }
    }

    /// Body of one opener work item: `num_open` was already incremented for it.
    pub(crate) async fn open_new_resource(self: &Arc<Self>) {
        let created = (self.factory)().await;
        let rejected = {
            let mut state = self.state.lock();
            match created {
                Err(source) => {
                    state.num_open -= 1;
                    tracing::warn!(pool = %self.name, error = %source, "background open failed");
                    let _ = self.put_pool_locked(&mut state, Err(Error::factory(&self.name, source)));
                    state.maybe_open_new();
                    None
                }
                Ok(resource) => {
                    let avatar = state.new_avatar(resource);
                    tracing::trace!(pool = %self.name, avatar = %avatar.id, "opened resource in background");
                    self.put_pool_locked(&mut state, Ok(avatar)).err().flatten()
                }
            }
        };
        if let Some(avatar) = rejected {
            let _ = self.close_avatar(avatar).await;
        }
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Return a leased avatar. `bad` discards it instead of reusing it.
    ///
    /// # Panics
    ///
    /// Panics if the avatar is not currently leased from this pool.
    pub(crate) fn release(self: &Arc<Self>, avatar: Avatar<R>, bad: bool) {
        let rejected = {
            let mut state = self.state.lock();
            assert!(
                state.leased.remove(&avatar.id),
                "resource returned that was never leased: {} (pool '{}')",
                avatar.id,
                self.name
            );
            if bad {
                state.maybe_open_new();
                Some(avatar)
            } else {
                self.put_pool_locked(&mut state, Ok(avatar)).err().flatten()
            }
        };
        if let Some(avatar) = rejected {
            self.close_detached(avatar);
        }
    }

    /// Hand a delivery to the oldest waiter, else park a healthy avatar on the
    /// free list. On rejection the avatar (if any) is given back to be closed.
    fn put_pool_locked(
        self: &Arc<Self>,
        state: &mut State<R>,
        delivery: Delivery<R>,
    ) -> std::result::Result<(), Option<Avatar<R>>> {
        if state.closed || (state.config.max_open > 0 && state.num_open > state.config.max_open) {
            return Err(delivery.ok());
        }

        let mut delivery = delivery;
        while let Some((key, tx)) = state.requests.pop_first() {
            if let Ok(avatar) = &delivery {
                state.leased.insert(avatar.id);
            }
            match tx.send(delivery) {
                Ok(()) => {
                    tracing::trace!(pool = %self.name, request = key, "handed resource to waiter");
                    return Ok(());
                }
                Err(returned) => {
                    if let Ok(avatar) = &returned {
                        state.leased.remove(&avatar.id);
                    }
                    delivery = returned;
                }
            }
        }

        match delivery {
            Ok(avatar) if state.free.len() < state.config.idle_limit() => {
                state.free.push(avatar);
                self.start_cleaner_locked(state);
                Ok(())
            }
            Ok(avatar) => Err(Some(avatar)),
            Err(_) => Err(None),
        }
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Drop the avatar's self-dependency and take its resource for closing.
    fn detach(&self, avatar: Avatar<R>) -> R {
        let mut state = self.state.lock();
        state.leased.remove(&avatar.id);
        match state.deps.remove_dep(&avatar.id, &avatar.id) {
            Removal::Final => avatar.resource,
            Removal::Pending => unreachable!("avatars only depend on themselves"),
        }
    }

    /// Close an avatar and wait for its resource to be finalized.
    pub(crate) async fn close_avatar(&self, avatar: Avatar<R>) -> Result<()> {
        let resource = self.detach(avatar);
        self.finalize(resource).await
    }

    /// Close an avatar from a synchronous context.
    ///
    /// Finalization is spawned onto the current runtime; without one the
    /// resource is dropped in place and only the bookkeeping runs.
    pub(crate) fn close_detached(self: &Arc<Self>, avatar: Avatar<R>) {
        let resource = self.detach(avatar);
        if let Ok(handle) = Handle::try_current() {
            let shared = Arc::clone(self);
            handle.spawn(async move {
                let _ = shared.finalize(resource).await;
            });
        } else {
            drop(resource);
            self.finalized();
        }
    }

    async fn finalize(&self, resource: R) -> Result<()> {
        let _slot = Finalizing {
            shared: self,
            pending: 1,
        };
        resource.close().await.map_err(|source| {
            tracing::warn!(pool = %self.name, error = %source, "resource close failed");
            Error::Close { source }
        })
    }

    fn finalized(&self) {
        {
            let mut state = self.state.lock();
            state.num_open -= 1;
            state.maybe_open_new();
        }
        self.num_closed.fetch_add(1, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub(crate) fn set_max_idle(self: &Arc<Self>, n: usize) {
        let excess: Vec<Avatar<R>> = {
            let mut state = self.state.lock();
            state.config.max_idle = Some(n);
            if state.config.max_open > 0 && n > state.config.max_open {
                state.config.max_idle = Some(state.config.max_open);
            }
            let limit = state.config.idle_limit();
            // Keep the most recently freed resources, drop the oldest.
            let surplus = state.free.len().saturating_sub(limit);
            state.free.drain(..surplus).collect()
        };
        if !excess.is_empty() {
            tracing::debug!(pool = %self.name, count = excess.len(), "closing surplus idle resources");
        }
        for avatar in excess {
            self.close_detached(avatar);
        }
    }

    pub(crate) fn set_max_open(self: &Arc<Self>, n: usize) {
        let shrink_idle = {
            let mut state = self.state.lock();
            state.config.max_open = n;
            // Raising the cap may unblock waiters.
            state.maybe_open_new();
            n > 0 && state.config.max_idle.unwrap_or(super::config::DEFAULT_MAX_IDLE) > n
        };
        if shrink_idle {
            self.set_max_idle(n);
        }
    }

    pub(crate) fn set_max_lifetime(self: &Arc<Self>, d: Duration) {
        let lifetime = (!d.is_zero()).then_some(d);
        let mut state = self.state.lock();
        if let (Some(new), Some(wake)) = (lifetime, state.cleaner.as_ref())
            && state.config.max_lifetime.is_some_and(|old| new < old)
        {
            wake.notify_one();
        }
        state.config.max_lifetime = lifetime;
        self.start_cleaner_locked(&mut state);
    }

    // -----------------------------------------------------------------------
    // Cleaner
    // -----------------------------------------------------------------------

    fn start_cleaner_locked(self: &Arc<Self>, state: &mut State<R>) {
        if state.closed || state.num_open == 0 || state.cleaner.is_some() {
            return;
        }
        let Some(lifetime) = state.config.max_lifetime else {
            return;
        };
        // Without a runtime the lifetime is still enforced lazily on reuse.
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let wake = Arc::new(Notify::new());
        state.cleaner = Some(Arc::clone(&wake));
        handle.spawn(tasks::run_cleaner(Arc::downgrade(self), wake, lifetime));
    }

    /// Pull expired avatars off the free list for the cleaner.
    ///
    /// Returns `None` when the cleaner should exit.
    pub(crate) fn take_expired(&self) -> Option<(Duration, Vec<Avatar<R>>)> {
        let mut state = self.state.lock();
        let lifetime = match state.config.max_lifetime {
            Some(d) if !state.closed && state.num_open > 0 => d,
            _ => {
                state.cleaner = None;
                return None;
            }
        };
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.free)
            .into_iter()
            .partition(|avatar| avatar.expired(Some(lifetime)));
        state.free = kept;
        Some((lifetime, expired))
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    pub(crate) async fn close(&self) -> Result<()> {
        let free = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.opener = None;
            if let Some(wake) = state.cleaner.take() {
                wake.notify_one();
            }
            // Dropping the senders wakes every waiter with `PoolClosed`.
            state.requests.clear();
            std::mem::take(&mut state.free)
        };
        tracing::debug!(pool = %self.name, idle = free.len(), "closing pool");

        let resources: Vec<R> = free.into_iter().map(|avatar| self.detach(avatar)).collect();
        let mut remaining = Finalizing {
            shared: self,
            pending: resources.len(),
        };
        let mut result = Ok(());
        for resource in resources {
            remaining.pending -= 1;
            if let Err(err) = self.finalize(resource).await {
                result = Err(err);
            }
        }
        result
    }
}

/// A registered waiter. Dropping it unsettled (cancellation, or the acquire
/// future being dropped) deregisters the request and returns any resource
/// that was delivered concurrently.
struct Waiter<'a, R: Resource> {
    shared: &'a Arc<Shared<R>>,
    key: u64,
    rx: oneshot::Receiver<Delivery<R>>,
    settled: bool,
}

impl<R: Resource> Drop for Waiter<'_, R> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.shared.state.lock().requests.remove(&self.key);
        if let Ok(Ok(avatar)) = self.rx.try_recv() {
            self.shared.release(avatar, false);
        }
    }
}

/// Slots of detached resources whose close has not finished. Dropping it
/// releases them, whether the close completed or its future was dropped.
struct Finalizing<'a, R: Resource> {
    shared: &'a Shared<R>,
    pending: usize,
}

impl<R: Resource> Drop for Finalizing<'_, R> {
    fn drop(&mut self) {
        for _ in 0..self.pending {
            self.shared.finalized();
        }
    }
}

/// A `num_open` slot reserved for a caller-driven open. Dropping it armed
/// (factory failure, or the acquire future being dropped mid-dial) gives the
/// slot back.
struct ReservedSlot<'a, R: Resource> {
    shared: &'a Shared<R>,
    armed: bool,
}

impl<R: Resource> ReservedSlot<'_, R> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<R: Resource> Drop for ReservedSlot<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.lock();
            state.num_open -= 1;
            state.maybe_open_new();
        }
    }
}
