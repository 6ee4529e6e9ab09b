use crate::backend::{Backend, Decision, SimpleBackend, SimpleInput, SimpleOutput, SimpleToken};
use crate::sweep::{CallSweeper, SweepPolicy, SweepTask};
use actix_web::rt::time::Instant;
use actix_web::{HttpResponse, ResponseError};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Expired buckets are swept before every check unless configured otherwise.
pub const DEFAULT_SWEEP_POLICY: SweepPolicy = SweepPolicy::EveryCall;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Rate limit interval {0:?} is too large")]
    IntervalOverflow(Duration),
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// A Fixed Window rate limiter [Backend] that uses [Dashmap](dashmap::DashMap) to store keys
/// in memory.
///
/// State lives for as long as the backend (and its clones) do, a restart gives every client a
/// full quota again.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Record>>,
    sweeper: Arc<CallSweeper>,
    _sweep_task: Option<Arc<SweepTask>>,
}

struct Record {
    reset: Instant,
    count: u64,
    success_count: u64,
    failure_count: u64,
}

impl Record {
    fn new(reset: Instant) -> Self {
        Self {
            reset,
            count: 0,
            success_count: 0,
            failure_count: 0,
        }
    }

    fn is_active(&self, now: Instant) -> bool {
        now < self.reset
    }

    /// Whether `token` was handed out for this record's current, still active window.
    fn issued(&self, token: &SimpleToken, now: Instant) -> bool {
        self.reset == token.reset && self.is_active(now)
    }
}

/// A copy of the state held for one rate limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSnapshot {
    /// Requests admitted in the current window.
    pub count: u64,
    /// Time at which the current window expires.
    pub reset: Instant,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Totals across every tracked key, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub tracked_keys: u64,
    pub successes: u64,
    pub failures: u64,
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            sweep_policy: DEFAULT_SWEEP_POLICY,
        }
    }

    /// Count a request against `input.key`, deciding whether it is admitted.
    ///
    /// A request is admitted while fewer than `max_requests` have been admitted in the current
    /// window, so exactly `max_requests` get through. Denied requests are not counted.
    pub fn check(&self, input: &SimpleInput) -> Result<(Decision, SimpleOutput), Error> {
        let now = Instant::now();
        if self.sweeper.tick() {
            self.sweep(now);
        }
        let fresh_reset = now
            .checked_add(input.interval)
            .ok_or(Error::IntervalOverflow(input.interval))?;

        let mut record = self
            .map
            .entry(input.key.clone())
            .or_insert_with(|| Record::new(fresh_reset));
        // An expired window is replaced outright, never decayed
        if !record.is_active(now) {
            *record = Record::new(fresh_reset);
        }
        let allow = record.count < input.max_requests;
        if allow {
            record.count += 1;
        }
        let output = SimpleOutput {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(record.count),
            reset: record.reset,
        };
        Ok((Decision::from_allowed(allow), output))
    }

    /// Bump the success or failure counter of an active key.
    ///
    /// Does nothing unless the window the token was issued in is still active, or if the token's
    /// skip flags exclude the outcome.
    pub fn record_outcome(&self, token: &SimpleToken, success: bool) {
        let now = Instant::now();
        if let Some(mut record) = self.map.get_mut(&token.key) {
            if !record.issued(token, now) {
                return;
            }
            if success && !token.skip_successful_requests {
                record.success_count += 1;
            } else if !success && !token.skip_failed_requests {
                record.failure_count += 1;
            }
        }
    }

    /// Returns the state of an active key.
    pub fn record(&self, key: &str) -> Option<RecordSnapshot> {
        let now = Instant::now();
        self.map
            .get(key)
            .filter(|r| r.is_active(now))
            .map(|r| RecordSnapshot {
                count: r.count,
                reset: r.reset,
                success_count: r.success_count,
                failure_count: r.failure_count,
            })
    }

    pub fn stats(&self) -> RateLimitStats {
        self.map
            .iter()
            .fold(RateLimitStats::default(), |mut stats, record| {
                stats.tracked_keys += 1;
                stats.successes += record.success_count;
                stats.failures += record.failure_count;
                stats
            })
    }

    /// Remove every key whose window has expired.
    pub fn cleanup(&self) {
        self.sweep(Instant::now());
    }

    fn sweep(&self, now: Instant) {
        let before = self.map.len();
        self.map.retain(|_k, v| v.is_active(now));
        let removed = before.saturating_sub(self.map.len());
        if removed > 0 {
            log::debug!("Swept {removed} expired rate limit keys");
        }
    }
}

impl Backend<SimpleInput> for InMemoryBackend {
    type Output = SimpleOutput;
    type Token = SimpleToken;
    type Error = Error;

    async fn request(
        &self,
        input: SimpleInput,
    ) -> Result<(Decision, Self::Output, Self::Token), Self::Error> {
        let (decision, output) = self.check(&input)?;
        let token = SimpleToken::new(&input, output.reset);
        Ok((decision, output, token))
    }

    async fn record_result(&self, token: Self::Token, success: bool) -> Result<(), Self::Error> {
        self.record_outcome(&token, success);
        Ok(())
    }

    async fn rollback(&self, token: Self::Token) -> Result<(), Self::Error> {
        let now = Instant::now();
        if let Some(mut record) = self.map.get_mut(&token.key) {
            // A token from an earlier window must not free up quota in the current one
            if record.issued(&token, now) {
                record.count = record.count.saturating_sub(1);
            }
        }
        Ok(())
    }
}

impl SimpleBackend for InMemoryBackend {
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    sweep_policy: SweepPolicy,
}

impl InMemoryBackendBuilder {
    /// Override when expired buckets are removed from the internal map.
    ///
    /// Defaults to [SweepPolicy::EveryCall], a full scan before each check. That is only
    /// reasonable while the number of distinct clients per window stays small.
    pub fn with_sweep_policy(mut self, policy: SweepPolicy) -> Self {
        self.sweep_policy = policy;
        self
    }

    /// # Panics
    ///
    /// With [SweepPolicy::Interval] this spawns onto the actix runtime, and panics if called
    /// outside of one or with a zero interval.
    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Record>::new());
        let _sweep_task = match self.sweep_policy {
            SweepPolicy::Interval(interval) => {
                let map = map.clone();
                Some(Arc::new(SweepTask::spawn(interval, move |now| {
                    map.retain(|_k, v| v.is_active(now));
                })))
            }
            _ => None,
        };
        InMemoryBackend {
            map,
            sweeper: Arc::new(CallSweeper::new(self.sweep_policy)),
            _sweep_task,
        }
    }
}
