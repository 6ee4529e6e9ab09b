//! Request admission control and memoization for a single actix-web process.
//!
//! - [RateLimiter]: fixed window rate limiting middleware, backed by an
//!   [InMemoryBackend](backend::InMemoryBackend).
//! - [TtlCache](cache::TtlCache): an in-memory cache with per entry expiry.
//!
//! Neither persists anything, restarting the process resets all counters and entries.

pub mod backend;
pub mod cache;
mod middleware;
pub mod policy;
pub mod sweep;

pub use cache::{CacheOptions, CacheStats, TtlCache};
pub use middleware::builder::{
    HeaderCompatibleOutput, RateLimiterBuilder, DEFAULT_REJECTION_MESSAGE,
};
pub use middleware::RateLimiter;
pub use policy::Policy;
pub use sweep::SweepPolicy;
