use crate::decider::{Decision, RateLimitDecider};
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter};
use crate::policy::PolicyDescriptor;
use crate::store::CounterStore;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub const DENIED_MESSAGE: &str = "Rate limit exceeded";

pub struct RateLimiterBuilder<S, F> {
    decider: RateLimitDecider<S>,
    policy_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl<S, F, O> RateLimiterBuilder<S, F>
where
    S: CounterStore + 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<Option<PolicyDescriptor>, actix_web::Error>>,
{
    pub(super) fn new(decider: RateLimitDecider<S>, policy_fn: F) -> Self {
        Self {
            decider,
            policy_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_: &Decision| HttpResponse::Forbidden().body(DENIED_MESSAGE)),
        }
    }

    /// Choose whether to allow a request if the counter store is unavailable.
    ///
    /// Default is false, in which case the request fails with a 503.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses whenever a policy was enforced:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, decision: Option<&Decision>| {
                if let Some(decision) = decision.filter(|d| d.current_count > 0) {
                    insert_headers(map, decision);
                }
            },
        ));
        self.denied_response = Rc::new(|decision: &Decision| {
            let mut response = HttpResponse::Forbidden().body(DENIED_MESSAGE);
            insert_headers(response.headers_mut(), decision);
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
    /// Note the [Decision] will be [None] if the counter store failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&Decision>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to a 403 with the body `Rate limit exceeded`.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Decision) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter<S, F> {
        RateLimiter {
            decider: self.decider,
            policy_fn: Rc::new(self.policy_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
        }
    }
}

fn insert_headers(map: &mut HeaderMap, decision: &Decision) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining()),
    );
}
