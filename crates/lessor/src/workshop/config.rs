//! Workshop configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Worker quota used when `max_quota` is zero.
pub const DEFAULT_MAX_QUOTA: usize = 64;

/// Idle timeout used when `idle_timeout` is zero.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Configuration for a [`Workshop`](super::Workshop)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WorkshopConfig {
    /// Maximum number of workers. `0` uses [`DEFAULT_MAX_QUOTA`].
    pub max_quota: usize,
    /// Maximum number of workers kept while they have no jobs.
    /// `None` keeps up to `max_quota`.
    pub max_idle: Option<usize>,
    /// How long an idle worker stays eligible for reuse.
    /// Zero uses [`DEFAULT_IDLE_TIMEOUT`].
    pub idle_timeout: Duration,
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            max_quota: DEFAULT_MAX_QUOTA,
            max_idle: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl WorkshopConfig {
    /// Validate workshop configuration, returning an error if invalid.
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(max_idle) = self.max_idle
            && max_idle > self.quota()
        {
            return Err(crate::error::Error::configuration(format!(
                "max_idle ({max_idle}) must not exceed max_quota ({})",
                self.quota()
            )));
        }
        Ok(())
    }

    /// The effective worker quota.
    #[must_use]
    pub fn quota(&self) -> usize {
        if self.max_quota == 0 {
            DEFAULT_MAX_QUOTA
        } else {
            self.max_quota
        }
    }

    /// The effective idle ceiling.
    #[must_use]
    pub fn idle_limit(&self) -> usize {
        self.max_idle.unwrap_or_else(|| self.quota())
    }

    /// The effective idle timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        if self.idle_timeout.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            self.idle_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = WorkshopConfig {
            max_quota: 0,
            max_idle: None,
            idle_timeout: Duration::ZERO,
        };
        assert_eq!(config.quota(), DEFAULT_MAX_QUOTA);
        assert_eq!(config.idle_limit(), DEFAULT_MAX_QUOTA);
        assert_eq!(config.timeout(), DEFAULT_IDLE_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::unset(4, None, true)]
    #[case::none_idle(4, Some(0), true)]
    #[case::at_quota(4, Some(4), true)]
    #[case::over_quota(4, Some(5), false)]
    #[case::over_default_quota(0, Some(65), false)]
    fn validation(#[case] max_quota: usize, #[case] max_idle: Option<usize>, #[case] ok: bool) {
        let config = WorkshopConfig {
            max_quota,
            max_idle,
            ..Default::default()
        };
        assert_eq!(config.validate().is_ok(), ok);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: WorkshopConfig =
            serde_json::from_str(r#"{"max_idle": 2, "idle_timeout": {"secs": 30, "nanos": 0}}"#).unwrap();
        assert_eq!(config.quota(), DEFAULT_MAX_QUOTA);
        assert_eq!(config.idle_limit(), 2);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }
}
