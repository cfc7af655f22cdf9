//! Workshop: a quota-bounded set of shared workers selected by load.
//!
//! Unlike a [`Pool`](crate::Pool), a worker is not leased exclusively: each
//! [`hire`](Workshop::hire) assigns one more job to the least-loaded worker.
//! New workers are created only while below quota and no worker is idle.
//! Hiring never blocks.

pub mod config;
mod info;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, Error, Result};

pub use config::WorkshopConfig;
pub use info::WorkerId;
use info::WorkerInfo;

/// Reported as the owner of workshop factory errors.
const WORKSHOP: &str = "workshop";

/// A long-lived worker shared by concurrent jobs.
pub trait Worker: Send + Sync + 'static {
    /// Whether the worker can keep taking jobs. Unhealthy workers are
    /// discarded the next time the workshop looks at them.
    fn health_check(&self) -> bool {
        true
    }

    /// Release the worker for good. Called once, outside the workshop lock.
    fn close(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

type WorkerFactory<W> = Box<dyn Fn() -> std::result::Result<W, BoxError> + Send + Sync>;

/// Workshop statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkshopStats {
    /// Workers currently managed.
    pub workers: usize,
    /// Workers with no jobs.
    pub idle: usize,
    /// Total workers ever created.
    pub created: u64,
    /// Total workers ever closed.
    pub closed: u64,
    /// Total hires.
    pub hired: u64,
    /// Total fires.
    pub fired: u64,
    /// Jobs in progress (`hired - fired`).
    pub doing: u64,
    /// Fewest jobs on any current worker; 0 when there are none.
    pub min_load: usize,
    /// Most jobs on any current worker; 0 when there are none.
    pub max_load: usize,
}

struct State<W> {
    infos: HashMap<WorkerId, WorkerInfo<W>>,
    /// Cached least-loaded worker.
    most_free: Option<WorkerId>,
    next_id: u64,
    idle: usize,
    /// Jobs not yet fired on workers that are still managed.
    outstanding: usize,
    created: u64,
    closed_count: u64,
    hired: u64,
    fired: u64,
    closed: bool,
}

impl<W> State<W> {
    fn new() -> Self {
        Self {
            infos: HashMap::new(),
            most_free: None,
            next_id: 0,
            idle: 0,
            outstanding: 0,
            created: 0,
            closed_count: 0,
            hired: 0,
            fired: 0,
            closed: false,
        }
    }

    fn recompute_most_free(&mut self) {
        self.most_free = self
            .infos
            .iter()
            .min_by_key(|(_, info)| info.job_num)
            .map(|(id, _)| *id);
    }

    /// Stop managing a worker. Its unfired jobs no longer count towards the
    /// drain; their leases only bump `fired` when they come back.
    fn evict(&mut self, id: WorkerId) -> Option<Arc<W>> {
        let info = self.infos.remove(&id)?;
        if info.is_idle() {
            self.idle -= 1;
        } else {
            self.outstanding -= info.job_num;
        }
        self.closed_count += 1;
        Some(info.worker)
    }
}

struct Inner<W: Worker> {
    config: WorkshopConfig,
    factory: WorkerFactory<W>,
    state: Mutex<State<W>>,
    /// Raised whenever `outstanding` reaches zero.
    drained: Notify,
    /// Stops the reaper.
    shutdown: CancellationToken,
}

impl<W: Worker> Inner<W> {
    fn hire(&self, evicted: &mut Vec<Arc<W>>) -> Result<(WorkerId, Arc<W>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(Error::WorkshopClosed);
        }
        let quota = self.config.quota();
        let now = Instant::now();

        loop {
            let reusable = state
                .most_free
                .and_then(|id| state.infos.get(&id).map(|info| (id, info.is_idle())))
                .filter(|&(_, idle)| idle || state.infos.len() >= quota);
            let Some((id, was_idle)) = reusable else {
                return self.create_locked(state);
            };

            let Some(info) = state
                .infos
                .get_mut(&id)
                .filter(|info| info.worker.health_check() && !info.idle_expired(now))
            else {
                tracing::debug!(worker = %id, "evicting stale worker");
                evicted.extend(state.evict(id));
                state.recompute_most_free();
                continue;
            };

            info.take_job();
            let worker = Arc::clone(&info.worker);
            if was_idle {
                state.idle -= 1;
            }
            state.hired += 1;
            state.outstanding += 1;
            state.recompute_most_free();
            return Ok((id, worker));
        }
    }

    fn create_locked(&self, state: &mut State<W>) -> Result<(WorkerId, Arc<W>)> {
        let worker = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.factory)())) {
            Ok(Ok(worker)) => worker,
            Ok(Err(source)) => {
                tracing::debug!(error = %source, "worker factory failed");
                return Err(Error::factory(WORKSHOP, source));
            }
            Err(payload) => {
                let err = Error::panicked(payload);
                tracing::warn!(error = %err, "worker factory panicked");
                return Err(err);
            }
        };

        let id = WorkerId(state.next_id);
        state.next_id += 1;
        let mut info = WorkerInfo::new(worker);
        info.take_job();
        let worker = Arc::clone(&info.worker);
        state.infos.insert(id, info);
        state.most_free = Some(id);
        state.created += 1;
        state.hired += 1;
        state.outstanding += 1;
        tracing::debug!(worker = %id, workers = state.infos.len(), "created worker");
        Ok((id, worker))
    }

    fn fire(&self, id: WorkerId) {
        let (evicted, drained) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.fired += 1;
            let Some(info) = state.infos.get_mut(&id) else {
                // Evicted while hired; its jobs were already written off.
                return;
            };
            let became_idle = info.finish_job(Instant::now(), self.config.timeout());
            let healthy = info.worker.health_check();
            state.outstanding -= 1;
            if became_idle {
                state.idle += 1;
            }

            let evicted = if !healthy {
                tracing::debug!(worker = %id, "discarding unhealthy worker");
                state.evict(id)
            } else if became_idle && state.idle > self.config.idle_limit() {
                tracing::trace!(worker = %id, idle = state.idle, "idle ceiling reached, closing worker");
                state.evict(id)
            } else {
                None
            };
            state.recompute_most_free();
            (evicted, state.outstanding == 0)
        };

        if drained {
            self.drained.notify_waiters();
        }
        close_workers(evicted);
    }

    /// Evict idle workers past their deadline and unhealthy workers.
    fn refresh(&self) {
        let (evicted, drained) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            let now = Instant::now();
            let stale: Vec<WorkerId> = state
                .infos
                .iter()
                .filter(|(_, info)| !info.worker.health_check() || info.idle_expired(now))
                .map(|(id, _)| *id)
                .collect();
            let evicted: Vec<Arc<W>> = stale.into_iter().filter_map(|id| state.evict(id)).collect();
            if !evicted.is_empty() {
                tracing::debug!(count = evicted.len(), "reaped stale workers");
                state.recompute_most_free();
            }
            (evicted, state.outstanding == 0)
        };

        if drained {
            self.drained.notify_waiters();
        }
        close_workers(evicted);
    }
}

impl<W: Worker> Drop for Inner<W> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn close_workers<W: Worker>(workers: impl IntoIterator<Item = Arc<W>>) {
    for worker in workers {
        if let Err(err) = worker.close() {
            tracing::warn!(error = %err, "worker close failed");
        }
    }
}

async fn run_reaper<W: Worker>(workshop: Weak<Inner<W>>, shutdown: CancellationToken, period: Duration) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(period) => {}
        }
        let Some(inner) = workshop.upgrade() else {
            return;
        };
        inner.refresh();
    }
}

/// One job assigned to a workshop worker.
///
/// Dereferences to the worker. Dropping it fires the job.
pub struct Hired<W: Worker> {
    id: WorkerId,
    worker: Arc<W>,
    inner: Arc<Inner<W>>,
}

impl<W: Worker> Hired<W> {
    /// The worker's identity within its workshop.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// A shared handle to the worker, usable beyond this job.
    #[must_use]
    pub fn worker(&self) -> Arc<W> {
        Arc::clone(&self.worker)
    }
}

impl<W: Worker> std::ops::Deref for Hired<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

impl<W: Worker> Drop for Hired<W> {
    fn drop(&mut self) {
        self.inner.fire(self.id);
    }
}

impl<W: Worker> std::fmt::Debug for Hired<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hired").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Load-balanced worker pool.
///
/// Cheap to clone; every clone refers to the same workshop.
pub struct Workshop<W: Worker> {
    inner: Arc<Inner<W>>,
}

impl<W: Worker> Clone for Workshop<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Worker> Workshop<W> {
    /// Create a workshop.
    ///
    /// When called inside a Tokio runtime, a background task evicts idle
    /// workers every `idle_timeout`; otherwise expiry is only checked on hire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new<F, E>(config: WorkshopConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> std::result::Result<W, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        config.validate()?;
        tracing::debug!(
            max_quota = config.quota(),
            max_idle = config.idle_limit(),
            idle_timeout = ?config.timeout(),
            "creating workshop"
        );
        let period = config.timeout();
        let inner = Arc::new(Inner {
            config,
            factory: Box::new(move || factory().map_err(Into::<BoxError>::into)),
            state: Mutex::new(State::new()),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(run_reaper(
                Arc::downgrade(&inner),
                inner.shutdown.clone(),
                period,
            ));
        }
        Ok(Self { inner })
    }

    /// Assign a job to the least-loaded worker, creating one if below quota
    /// and no worker is idle.
    ///
    /// # Errors
    ///
    /// - [`Error::WorkshopClosed`] after [`close`](Self::close)
    /// - [`Error::Factory`] or [`Error::Panicked`] if creating a worker fails
    pub fn hire(&self) -> Result<Hired<W>> {
        let mut evicted = Vec::new();
        let hired = self.inner.hire(&mut evicted);
        close_workers(evicted);
        let (id, worker) = hired?;
        tracing::trace!(worker = %id, "hired worker");
        Ok(Hired {
            id,
            worker,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Complete a job. Same as dropping the [`Hired`] handle.
    pub fn fire(&self, hired: Hired<W>) {
        drop(hired);
    }

    /// Hire a worker, run `f` with it and fire it, even if `f` panics.
    ///
    /// # Errors
    ///
    /// Hire errors, [`Error::Callback`] if `f` fails, [`Error::Panicked`] if
    /// it panics.
    pub async fn callback<F, Fut, T, E>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<W>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let hired = self.hire()?;
        let worker = hired.worker();
        let outcome = AssertUnwindSafe(async move { f(worker).await })
            .catch_unwind()
            .await;
        drop(hired);
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::Callback { source: err.into() }),
            Err(payload) => {
                let err = Error::panicked(payload);
                tracing::warn!(error = %err, "workshop callback panicked");
                Err(err)
            }
        }
    }

    /// Snapshot of the workshop's counters and load.
    #[must_use]
    pub fn stats(&self) -> WorkshopStats {
        let state = self.inner.state.lock();
        let loads = state.infos.values().map(|info| info.job_num);
        WorkshopStats {
            workers: state.infos.len(),
            idle: state.idle,
            created: state.created,
            closed: state.closed_count,
            hired: state.hired,
            fired: state.fired,
            doing: state.hired - state.fired,
            min_load: loads.clone().min().unwrap_or(0),
            max_load: loads.max().unwrap_or(0),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stop hiring, wait for outstanding jobs and close every worker.
    ///
    /// Idempotent; a second call returns immediately.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.shutdown.cancel();

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let outstanding = self.inner.state.lock().outstanding;
            if outstanding == 0 {
                break;
            }
            tracing::debug!(outstanding, "waiting for workshop jobs to drain");
            notified.await;
        }

        let workers: Vec<Arc<W>> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.idle = 0;
            state.most_free = None;
            state.closed_count += state.infos.len() as u64;
            state.infos.drain().map(|(_, info)| info.worker).collect()
        };
        tracing::debug!(workers = workers.len(), "closing workshop");
        close_workers(workers);
    }
}

impl<W: Worker> std::fmt::Debug for Workshop<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workshop")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}
