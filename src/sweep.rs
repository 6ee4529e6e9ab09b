use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Controls when expired entries are physically removed from a store.
///
/// Expired entries are always treated as absent, regardless of the policy; sweeping only
/// reclaims their memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPolicy {
    /// Never sweep automatically, only when `cleanup` is called.
    Manual,
    /// Sweep on every counted call (rate limit checks, or cache writes).
    EveryCall,
    /// Sweep on every nth counted call.
    EveryNCalls(NonZeroU64),
    /// Sweep periodically from a task spawned on the actix runtime.
    ///
    /// The task is aborted once the last handle to the store is dropped.
    Interval(Duration),
}

/// Tracks counted calls for the call based sweep policies.
pub(crate) struct CallSweeper {
    policy: SweepPolicy,
    calls: AtomicU64,
}

impl CallSweeper {
    pub(crate) fn new(policy: SweepPolicy) -> Self {
        Self {
            policy,
            calls: AtomicU64::new(0),
        }
    }

    /// Registers a call, returning whether a sweep is due.
    pub(crate) fn tick(&self) -> bool {
        match self.policy {
            SweepPolicy::EveryCall => true,
            SweepPolicy::EveryNCalls(n) => {
                let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
                calls % n.get() == 0
            }
            SweepPolicy::Manual | SweepPolicy::Interval(_) => false,
        }
    }
}

/// Background sweeper, aborted on drop.
pub(crate) struct SweepTask(JoinHandle<()>);

impl SweepTask {
    pub(crate) fn spawn<F>(interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut(Instant) + 'static,
    {
        assert!(
            interval.as_secs_f64() > 0f64,
            "Sweep interval must be non-zero"
        );
        SweepTask(actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                sweep(now);
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        }))
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
