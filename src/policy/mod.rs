use crate::backend::{
    Backend, SimpleInput, SimpleInputFunctionBuilder, SimpleInputFuture, SimpleOutput,
};
use crate::middleware::builder::DEFAULT_REJECTION_MESSAGE;
use crate::RateLimiterBuilder;
use actix_web::dev::ServiceRequest;
use std::time::Duration;

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Rate limit settings for one category of endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Namespace for the rate limit keys, so that policies can share a backend.
    pub name: String,
    /// The rate limiting interval.
    pub interval: Duration,
    /// The total requests to be allowed within the interval.
    pub max_requests: u64,
    /// Error text in the body of denied responses.
    pub message: String,
    /// Leave successful outcomes out of the success counter.
    pub skip_successful_requests: bool,
    /// Leave failed outcomes out of the failure counter.
    pub skip_failed_requests: bool,
    /// Give back the quota of every request that did not fail, so that only failures count
    /// towards the limit.
    pub count_failed_only: bool,
}

impl Policy {
    pub fn new(name: &str, interval: Duration, max_requests: u64) -> Self {
        Self {
            name: name.to_owned(),
            interval,
            max_requests,
            message: DEFAULT_REJECTION_MESSAGE.to_owned(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            count_failed_only: false,
        }
    }

    /// General API traffic: 100 requests per 15 minutes.
    pub fn api() -> Self {
        Self::new("api", FIFTEEN_MINUTES, 100)
    }

    /// Login and other credential checks: 5 failed attempts per 15 minutes.
    pub fn auth() -> Self {
        Self {
            message: "Too many login attempts, please try again later.".to_owned(),
            skip_successful_requests: true,
            count_failed_only: true,
            ..Self::new("auth", FIFTEEN_MINUTES, 5)
        }
    }

    /// Sensitive operations such as exports and password resets: 10 requests per minute.
    pub fn sensitive() -> Self {
        Self {
            message: "Too many requests to a sensitive endpoint, please slow down.".to_owned(),
            ..Self::new("sensitive", ONE_MINUTE, 10)
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_owned();
        self
    }

    /// The [SimpleInput] for a given client under this policy.
    pub fn input(&self, client: &str) -> SimpleInput {
        SimpleInput {
            interval: self.interval,
            max_requests: self.max_requests,
            key: format!("{}-{}", self.name, client),
            skip_successful_requests: self.skip_successful_requests,
            skip_failed_requests: self.skip_failed_requests,
        }
    }

    /// An input function keying requests by client identifier within this policy's namespace.
    pub fn input_function_builder(&self) -> SimpleInputFunctionBuilder {
        SimpleInputFunctionBuilder::new(self.interval, self.max_requests)
            .custom_key(&self.name)
            .client_key()
            .skip_successful_requests(self.skip_successful_requests)
            .skip_failed_requests(self.skip_failed_requests)
    }
}

/// Wires up a [RateLimiterBuilder] for a policy: client keyed input, rate limit headers and a
/// JSON rejection carrying the policy's message.
///
/// Build the result once per policy and share it, e.g.
///
/// ```no_run
/// # use inventory_guard::backend::InMemoryBackend;
/// # use inventory_guard::policy::{rate_limiter, Policy};
/// # use actix_web::{web, App};
/// let backend = InMemoryBackend::builder().build();
/// let auth = rate_limiter(backend.clone(), &Policy::auth()).build();
/// let app = App::new().service(web::scope("/auth").wrap(auth));
/// ```
pub fn rate_limiter<BA>(
    backend: BA,
    policy: &Policy,
) -> RateLimiterBuilder<BA, SimpleOutput, impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static>
where
    BA: Backend<SimpleInput, Output = SimpleOutput> + 'static,
{
    let input_fn = policy.input_function_builder().build();
    let builder = crate::RateLimiter::builder(backend, input_fn)
        .add_headers()
        .json_rejection(policy.message.clone());
    if policy.count_failed_only {
        builder.rollback_successful()
    } else {
        builder
    }
}
