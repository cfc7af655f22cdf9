//! Error types for pool and workshop operations
use std::any::Any;

use thiserror::Error;

/// Boxed error produced by factories, resource close hooks and callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool and workshop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for every public pool and workshop operation.
///
/// Invariant violations (an unpaired dependency removal, returning a resource
/// that was never leased) are not represented here: they panic.
#[derive(Error, Debug)]
pub enum Error {
    /// The pool was closed before or during the operation
    #[error("Pool '{pool}' is closed")]
    PoolClosed {
        /// The pool name
        pool: String,
    },

    /// A leased resource outlived the configured maximum lifetime
    #[error("Pool '{pool}' handed out an expired resource")]
    Expired {
        /// The pool name
        pool: String,
    },

    /// The caller-supplied factory failed to construct a resource
    #[error("Factory failed for pool '{pool}': {source}")]
    Factory {
        /// The pool name
        pool: String,
        /// The factory's own error, unchanged
        #[source]
        source: BoxError,
    },

    /// The caller's context was cancelled while waiting for a resource
    #[error("Acquire on pool '{pool}' was cancelled")]
    Cancelled {
        /// The pool name
        pool: String,
    },

    /// The workshop was closed before the hire
    #[error("Workshop is closed")]
    WorkshopClosed,

    /// A callback returned an error
    #[error("Callback failed: {source}")]
    Callback {
        /// The callback's error
        #[source]
        source: BoxError,
    },

    /// A callback or factory panicked; the panic was recovered
    #[error("Panicked: {message}")]
    Panicked {
        /// The panic payload, rendered as text
        message: String,
    },

    /// A resource or worker failed to close cleanly
    #[error("Close failed: {source}")]
    Close {
        /// The underlying error
        #[source]
        source: BoxError,
    },

    /// Pool or workshop configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl Error {
    /// Create a pool-closed error
    pub fn pool_closed(pool: impl Into<String>) -> Self {
        Self::PoolClosed { pool: pool.into() }
    }

    /// Create an expired-resource error
    pub fn expired(pool: impl Into<String>) -> Self {
        Self::Expired { pool: pool.into() }
    }

    /// Wrap a factory failure
    pub fn factory(pool: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Factory {
            pool: pool.into(),
            source: source.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(pool: impl Into<String>) -> Self {
        Self::Cancelled { pool: pool.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Convert a recovered panic payload into an error.
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked { message }
    }

    /// Check if this error is worth another acquire attempt
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::Factory { .. })
    }

    /// Get the pool name associated with this error (if any)
    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        match self {
            Self::PoolClosed { pool }
            | Self::Expired { pool }
            | Self::Factory { pool, .. }
            | Self::Cancelled { pool } => Some(pool),
            Self::WorkshopClosed
            | Self::Callback { .. }
            | Self::Panicked { .. }
            | Self::Close { .. }
            | Self::Configuration { .. } => None,
        }
    }
}
