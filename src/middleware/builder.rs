use crate::backend::Backend;
use crate::middleware::{
    is_success, AllowedTransformation, DeniedResponse, RateLimiter, RollbackCondition,
};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::future::Future;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub const DEFAULT_REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// JSON body of a rejected request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Rejection<'a> {
    success: bool,
    error: &'a str,
    retry_after: u64,
}

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(crate) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_| HttpResponse::TooManyRequests().finish()),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (UNIX timestamp in seconds of the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    ///
    /// The denied response has an empty body; call [RateLimiterBuilder::json_rejection]
    /// afterwards to get a JSON body as well.
    ///
    /// This function requires the Backend Output to implement [HeaderCompatibleOutput]
    pub fn add_headers(mut self) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        self.allowed_transformation = Some(Rc::new(|map: &mut HeaderMap, output: Option<&BO>| {
            if let Some(status) = output {
                insert_headers(map, status, false);
            }
        }));
        self.denied_response = Rc::new(|status: &BO| {
            let mut response = HttpResponse::TooManyRequests().finish();
            insert_headers(response.headers_mut(), status, true);
            response
        });
        self
    }

    /// Deny requests with a 429 JSON body, along with the headers from
    /// [RateLimiterBuilder::add_headers]:
    ///
    /// ```json
    /// {"success": false, "error": "<message>", "retryAfter": 42}
    /// ```
    pub fn json_rejection(mut self, message: impl Into<String>) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        let message = message.into();
        self.denied_response = Rc::new(move |status: &BO| {
            let mut response = HttpResponse::TooManyRequests().json(Rejection {
                success: false,
                error: &message,
                retry_after: status.seconds_until_reset(),
            });
            insert_headers(response.headers_mut(), status, true);
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [Backend::Output] will be [None] if the backend failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation<BO>>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to an empty body with status 429.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// After processing a request, attempt to rollback the request count based on the status code
    /// of the returned response.
    ///
    /// By default the rate limit is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status| status.is_server_error()));
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback any response below
    /// 400, so that only failed attempts count towards the limit.
    pub fn rollback_successful(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(is_success));
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn insert_headers<BO: HeaderCompatibleOutput>(map: &mut HeaderMap, status: &BO, retry_after: bool) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(status.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(status.reset_epoch_seconds()),
    );
    if retry_after {
        map.insert(RETRY_AFTER, HeaderValue::from(status.seconds_until_reset()));
    }
}

/// A trait that a [Backend::Output] should implement in order to use the
/// [RateLimiterBuilder::add_headers] function.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `retry-after` header.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;

    /// Value for the `x-ratelimit-reset` header, the UNIX time in seconds of the reset.
    fn reset_epoch_seconds(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        now + self.seconds_until_reset()
    }
}
