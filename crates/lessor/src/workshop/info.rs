//! Per-worker load bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Workshop-unique identity of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Load record for one worker, guarded by the workshop lock.
pub(crate) struct WorkerInfo<W> {
    pub(crate) worker: Arc<W>,
    /// Jobs currently assigned.
    pub(crate) job_num: usize,
    /// Set while the worker is idle: when it stops being eligible for reuse.
    pub(crate) idle_expire: Option<Instant>,
}

impl<W> WorkerInfo<W> {
    pub(crate) fn new(worker: W) -> Self {
        Self {
            worker: Arc::new(worker),
            job_num: 0,
            idle_expire: None,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.job_num == 0
    }

    /// Whether an idle worker has passed its deadline. Busy workers never expire.
    pub(crate) fn idle_expired(&self, now: Instant) -> bool {
        self.is_idle() && self.idle_expire.is_some_and(|deadline| now > deadline)
    }

    /// Assign one job.
    pub(crate) fn take_job(&mut self) {
        self.job_num += 1;
        self.idle_expire = None;
    }

    /// Complete one job. Returns `true` if the worker just became idle, in
    /// which case its deadline is set `timeout` from `now`.
    pub(crate) fn finish_job(&mut self, now: Instant, timeout: Duration) -> bool {
        self.job_num -= 1;
        if self.job_num == 0 {
            self.idle_expire = Some(now + timeout);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_accounting() {
        let now = Instant::now();
        let mut info = WorkerInfo::new(());
        assert!(info.is_idle());

        info.take_job();
        info.take_job();
        assert!(!info.finish_job(now, Duration::from_secs(1)));
        assert!(info.idle_expire.is_none());
        assert!(info.finish_job(now, Duration::from_secs(1)));
        assert_eq!(info.idle_expire, Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn only_idle_workers_expire() {
        let now = Instant::now();
        let mut info = WorkerInfo::new(());
        info.take_job();
        assert!(!info.idle_expired(now + Duration::from_secs(60)));

        info.finish_job(now, Duration::from_secs(1));
        assert!(!info.idle_expired(now));
        assert!(info.idle_expired(now + Duration::from_secs(2)));
    }

    #[test]
    fn id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }
}
