//! RAII lease on a pooled resource

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::avatar::{Avatar, AvatarId};
use super::shared::Shared;
use crate::resource::Resource;

/// A resource checked out of a [`Pool`](super::Pool).
///
/// Dereferences to the resource. Dropping the lease returns the resource to
/// its pool as healthy; use [`Pool::put`](super::Pool::put) with an error to
/// discard a resource that went bad while leased.
pub struct Lease<R: Resource> {
    avatar: Option<Avatar<R>>,
    shared: Arc<Shared<R>>,
}

impl<R: Resource> Lease<R> {
    pub(crate) fn new(avatar: Avatar<R>, shared: Arc<Shared<R>>) -> Self {
        Self {
            avatar: Some(avatar),
            shared,
        }
    }

    fn avatar(&self) -> &Avatar<R> {
        self.avatar.as_ref().expect("lease used after release")
    }

    /// Pool-unique identity of the leased resource. Stable across leases,
    /// so two leases with the same id hold the same resource instance.
    #[must_use]
    pub fn id(&self) -> AvatarId {
        self.avatar().id
    }

    /// When the underlying resource was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.avatar().created_at
    }

    /// Time since the underlying resource was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.avatar().created_at.elapsed()
    }

    /// Name of the pool the resource belongs to.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        self.shared.name()
    }

    /// Hand the resource back to its pool, discarding it when `bad` is set.
    pub(crate) fn release(mut self, bad: bool) {
        if let Some(avatar) = self.avatar.take() {
            self.shared.release(avatar, bad);
        }
    }
}

impl<R: Resource> std::ops::Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.avatar().resource
    }
}

impl<R: Resource> std::ops::DerefMut for Lease<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.avatar.as_mut().expect("lease used after release").resource
    }
}

impl<R: Resource> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(avatar) = self.avatar.take() {
            self.shared.release(avatar, false);
        }
    }
}

impl<R: Resource + std::fmt::Debug> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.shared.name())
            .field("id", &self.avatar.as_ref().map(|a| a.id))
            .field("resource", &self.avatar.as_ref().map(|a| &a.resource))
            .finish()
    }
}
