mod input_builder;
pub mod memory;

pub use input_builder::{
    client_identifier, SimpleInputFunctionBuilder, SimpleInputFuture, UNKNOWN_CLIENT,
};
pub use memory::{InMemoryBackend, InMemoryBackendBuilder};
use std::future::Future;

use crate::HeaderCompatibleOutput;
use actix_web::rt::time::Instant;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc).
pub trait Backend<I: 'static = SimpleInput>: Clone {
    type Output;
    /// Identifies the counter touched by a request, for later bookkeeping or rollback.
    type Token: Clone;
    type Error;

    /// Process an incoming request.
    ///
    /// Returns whether to allow or deny the request, output that can be used to transform the
    /// allowed and denied responses, and a token referring to the counter that was used.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::Token), Self::Error>>;

    /// Report the outcome of a request that was allowed through.
    ///
    /// This is bookkeeping only and never changes future decisions.
    fn record_result(
        &self,
        token: Self::Token,
        success: bool,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Deduct an allowed request from the counter again.
    ///
    /// E.g. a login endpoint may only want failed attempts to count against a client; we can
    /// only tell after having already allowed the request through, so the count is deducted
    /// afterwards.
    ///
    /// Note that if this function fails there is not much the [RateLimiter](crate::RateLimiter)
    /// can do about it, given that the request has already been allowed.
    fn rollback(&self, token: Self::Token) -> impl Future<Output = Result<(), Self::Error>>;
}

/// A default [Backend] Input structure.
#[derive(Debug, Clone)]
pub struct SimpleInput {
    /// The rate limiting interval.
    pub interval: Duration,
    /// The total requests to be allowed within the interval.
    pub max_requests: u64,
    /// The rate limit key to be used for this request.
    pub key: String,
    /// Don't count successful outcomes in the success counter.
    pub skip_successful_requests: bool,
    /// Don't count failed outcomes in the failure counter.
    pub skip_failed_requests: bool,
}

impl SimpleInput {
    pub fn new(key: impl Into<String>, interval: Duration, max_requests: u64) -> Self {
        Self {
            interval,
            max_requests,
            key: key.into(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

/// A default [Backend::Output] structure.
#[derive(Debug, Clone)]
pub struct SimpleOutput {
    /// Total number of requests that are permitted within the rate limit interval.
    pub limit: u64,
    /// Number of requests that will be permitted until the limit resets.
    pub remaining: u64,
    /// Time at which the rate limit resets.
    pub reset: Instant,
}

/// Token handed out by a [SimpleBackend] for each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleToken {
    pub key: String,
    /// Reset time of the window the request was counted in.
    ///
    /// Bookkeeping and rollback only apply while that same window is still current.
    pub reset: Instant,
    pub skip_successful_requests: bool,
    pub skip_failed_requests: bool,
}

impl SimpleToken {
    pub fn new(input: &SimpleInput, reset: Instant) -> Self {
        Self {
            key: input.key.clone(),
            reset,
            skip_successful_requests: input.skip_successful_requests,
            skip_failed_requests: input.skip_failed_requests,
        }
    }
}

/// Additional functions for a [Backend] that uses [SimpleInput] and [SimpleOutput].
pub trait SimpleBackend: Backend<SimpleInput, Output = SimpleOutput, Token = SimpleToken> {
    /// Removes the bucket for a given rate limit key.
    ///
    /// Intended to be used to reset a key before changing the interval.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

impl HeaderCompatibleOutput for SimpleOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the rate limit resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}
