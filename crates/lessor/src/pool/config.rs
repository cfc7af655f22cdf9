//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of idle resources retained when `max_idle` is left unset.
pub const DEFAULT_MAX_IDLE: usize = 2;

/// Configuration for resource pooling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Maximum number of open resources (leased, idle and being opened).
    /// `0` means unlimited.
    pub max_open: usize,
    /// Maximum number of idle resources kept for reuse.
    /// `None` retains [`DEFAULT_MAX_IDLE`]; `Some(0)` retains nothing.
    pub max_idle: Option<usize>,
    /// Maximum time a resource may be reused after it was created.
    /// `None` reuses resources forever.
    pub max_lifetime: Option<Duration>,
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_lifetime.is_some_and(|d| d.is_zero()) {
            return Err(crate::error::Error::configuration(
                "max_lifetime must be greater than zero (use None for unlimited)",
            ));
        }
        if self.max_open > 0 && self.max_idle.is_some_and(|n| n > self.max_open) {
            return Err(crate::error::Error::configuration(format!(
                "max_idle ({}) must not exceed max_open ({})",
                self.max_idle.unwrap_or_default(),
                self.max_open
            )));
        }
        Ok(())
    }

    /// The number of idle resources the pool may actually retain.
    #[must_use]
    pub fn idle_limit(&self) -> usize {
        let limit = self.max_idle.unwrap_or(DEFAULT_MAX_IDLE);
        if self.max_open > 0 {
            limit.min(self.max_open)
        } else {
            limit
        }
    }
}
