#![cfg_attr(docsrs, feature(doc_cfg))]

mod decider;
mod middleware;
pub mod policy;
pub mod store;

pub use decider::{
    Decision, RateLimitDecider, RateLimitDeciderBuilder, StoreFailure, StoreUnavailable,
    DEFAULT_RESPONSE_TIMEOUT, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_INTERVAL,
};
pub use middleware::builder::RateLimiterBuilder;
pub use middleware::{PolicyFunctionBuilder, PolicyFuture, RateLimiter};
pub use policy::{PolicyDescriptor, TimeUnit};
