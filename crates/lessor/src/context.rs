//! Acquire context with cancellation support

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

/// Context for a blocking acquire.
///
/// Carries the caller's cancellation token and arbitrary metadata. Timeouts
/// are expressed by cancelling the token; the pool itself never times out an
/// acquire.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Cooperative cancellation token. A waiting acquire returns
    /// [`Error::Cancelled`](crate::Error::Cancelled) once it fires.
    pub cancellation: CancellationToken,
    /// Arbitrary key-value pairs, attached to trace events for the acquire.
    pub metadata: HashMap<String, String>,
}

impl Context {
    /// Create a context that is never cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key-value metadata pair to the context.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the default cancellation token with the provided one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Whether the caller has already given up.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.metadata.is_empty());
    }

    #[test]
    fn test_context_with_metadata() {
        let ctx = Context::new()
            .with_metadata("caller", "billing")
            .with_metadata("region", "us-east-1");
        assert_eq!(ctx.metadata.get("caller").unwrap(), "billing");
        assert_eq!(ctx.metadata.get("region").unwrap(), "us-east-1");
    }

    #[test]
    fn test_context_with_cancellation() {
        let token = CancellationToken::new();
        let child = token.child_token();
        let ctx = Context::new().with_cancellation(child);
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
