//! Background tasks owned by a pool.
//!
//! Both tasks hold only a `Weak` reference, so they never keep a pool alive
//! on their own.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use super::shared::Shared;
use crate::resource::Resource;

/// Floor for the cleaner's sleep between sweeps.
const MIN_CLEANER_INTERVAL: Duration = Duration::from_secs(1);

/// Opens resources on behalf of blocked acquires, one per work item.
///
/// Exits once the pool is closed (the sender is dropped) or gone.
pub(crate) async fn run_opener<R: Resource>(
    pool: Weak<Shared<R>>,
    mut requests: mpsc::UnboundedReceiver<()>,
) {
    while requests.recv().await.is_some() {
        let Some(shared) = pool.upgrade() else {
            break;
        };
        shared.open_new_resource().await;
    }
    tracing::trace!("pool opener stopped");
}

/// Periodically closes idle resources that outlived the pool's lifetime.
///
/// Exits when the pool is closed, has no open resources, or no longer has a
/// lifetime configured.
pub(crate) async fn run_cleaner<R: Resource>(
    pool: Weak<Shared<R>>,
    wake: Arc<Notify>,
    lifetime: Duration,
) {
    let mut period = lifetime;
    loop {
        tokio::select! {
            () = tokio::time::sleep(period.max(MIN_CLEANER_INTERVAL)) => {}
            () = wake.notified() => {}
        }

        let Some(shared) = pool.upgrade() else {
            return;
        };
        let Some((lifetime, expired)) = shared.take_expired() else {
            tracing::trace!(pool = %shared.name(), "pool cleaner stopped");
            return;
        };
        period = lifetime;

        if !expired.is_empty() {
            tracing::debug!(pool = %shared.name(), count = expired.len(), "closing expired idle resources");
        }
        for avatar in expired {
            let _ = shared.close_avatar(avatar).await;
        }
    }
}
