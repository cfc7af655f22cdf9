//! The pool's record of one live resource.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Pool-unique identity of an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AvatarId(pub(crate) u64);

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "avatar-{}", self.0)
    }
}

/// Binds one live resource to its pool.
///
/// An avatar is owned by exactly one place at a time: the free list, a
/// [`Lease`](super::Lease), a waiter's reply channel, or the finalizer. Moving
/// it into the finalizer is what makes finalization happen at most once.
pub(crate) struct Avatar<R> {
    pub(crate) id: AvatarId,
    pub(crate) created_at: Instant,
    pub(crate) resource: R,
}

impl<R> Avatar<R> {
    pub(crate) fn new(id: AvatarId, resource: R) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            resource,
        }
    }

    /// Whether the avatar has outlived `lifetime`. `None` never expires.
    pub(crate) fn expired(&self, lifetime: Option<Duration>) -> bool {
        lifetime.is_some_and(|d| self.created_at.elapsed() > d)
    }
}

impl<R> fmt::Debug for Avatar<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Avatar")
            .field("id", &self.id)
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}
