pub mod builder;
mod input_builder;

pub use input_builder::{PolicyFunctionBuilder, PolicyFuture};

use crate::decider::{Decision, RateLimitDecider};
use crate::policy::PolicyDescriptor;
use crate::store::CounterStore;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::{HttpResponse, ResponseError};
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::{future::Future, rc::Rc};

type AllowedTransformation = dyn Fn(&mut HeaderMap, Option<&Decision>);
type DeniedResponse = dyn Fn(&Decision) -> HttpResponse;

/// Rate limit middleware.
///
/// For every request the policy function yields the [PolicyDescriptor] to enforce (or [None]),
/// which is then judged by the [RateLimitDecider].
pub struct RateLimiter<S, F> {
    decider: RateLimitDecider<S>,
    policy_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl<S, F, O> Clone for RateLimiter<S, F>
where
    S: CounterStore + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<PolicyDescriptor>, actix_web::Error>>,
{
    fn clone(&self) -> Self {
        Self {
            decider: self.decider.clone(),
            policy_fn: self.policy_fn.clone(),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
        }
    }
}

impl<S, F, O> RateLimiter<S, F>
where
    S: CounterStore + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<PolicyDescriptor>, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `decider`: Judges requests against a shared counter store.
    /// * `policy_fn`: A future that produces the policy (if any) for the incoming request.
    pub fn builder(decider: RateLimitDecider<S>, policy_fn: F) -> RateLimiterBuilder<S, F> {
        RateLimiterBuilder::new(decider, policy_fn)
    }
}

impl<T, B, S, F, O> Transform<T, ServiceRequest> for RateLimiter<S, F>
where
    T: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    T::Future: 'static,
    B: 'static,
    S: CounterStore + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<PolicyDescriptor>, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<T, S, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: T) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            decider: self.decider.clone(),
            policy_fn: Rc::clone(&self.policy_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<T, S, F> {
    service: Rc<RefCell<T>>,
    decider: RateLimitDecider<S>,
    policy_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl<T, B, S, F, O> Service<ServiceRequest> for RateLimiterMiddleware<T, S, F>
where
    T: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    T::Future: 'static,
    B: 'static,
    S: CounterStore + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<PolicyDescriptor>, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let decider = self.decider.clone();
        let policy_fn = self.policy_fn.clone();
        let fail_open = self.fail_open;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();

        Box::pin(async move {
            let policy = match (policy_fn)(&req).await {
                Ok(policy) => policy,
                Err(e) => {
                    log::error!("Rate limiter policy function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let decision = match decider.decide(policy.as_ref()).await {
                // Able to reach the counter store
                Ok(decision) => {
                    if decision.is_denied() {
                        let response: HttpResponse = (denied_response)(&decision);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Some(decision)
                }
                // Unable to reach the counter store
                Err(e) => {
                    if fail_open {
                        log::warn!("Rate limiter failed: {e}, allowing the request anyway");
                        None
                    } else {
                        log::error!("Rate limiter failed: {e}");
                        return Ok(req.into_response(e.error_response()).map_into_right_body());
                    }
                }
            };

            let mut service_response = service.call(req).await?;

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), decision.as_ref());
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
