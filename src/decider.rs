use crate::policy::{CounterKey, PolicyDescriptor};
use crate::store::CounterStore;
use actix_web::http::StatusCode;
use actix_web::rt::time::{sleep, timeout, Instant};
use actix_web::{HttpResponse, ResponseError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The outcome of a single admission check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub admitted: bool,
    /// Count of the current window including this request, 0 when no policy was enforced.
    pub current_count: u64,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
}

impl Decision {
    fn unenforced(limit: u64) -> Self {
        Self {
            admitted: true,
            current_count: 0,
            limit,
        }
    }

    pub fn is_allowed(self) -> bool {
        self.admitted
    }

    pub fn is_denied(self) -> bool {
        !self.admitted
    }

    /// Number of requests that will be permitted until the window closes.
    pub fn remaining(self) -> u64 {
        self.limit.saturating_sub(self.current_count)
    }
}

/// Why a counter store call could not produce a count.
#[derive(Debug, Error)]
pub enum StoreFailure<E: std::error::Error + 'static> {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Backend(#[source] E),
    #[error("caller deadline elapsed")]
    Cancelled,
}

/// The counter store could not be reached, so no decision was made.
///
/// This is never converted into an admission or a rejection by the decider.
#[derive(Debug, Error)]
#[error("Counter store unavailable after {attempts} attempt(s): {cause}")]
pub struct StoreUnavailable<E: std::error::Error + 'static> {
    pub attempts: u32,
    #[source]
    pub cause: StoreFailure<E>,
}

impl<E: std::error::Error + 'static> ResponseError for StoreUnavailable<E> {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::ServiceUnavailable().finish()
    }
}

/// Decides whether a request may proceed under a fixed window policy.
///
/// All coordination between concurrent callers, in this process or another, happens inside the
/// [CounterStore]; the decider itself holds no state besides its configuration.
///
/// A missing or malformed [PolicyDescriptor] always admits the request without touching the
/// store, whereas a store failure is always surfaced as a [StoreUnavailable] error.
#[derive(Clone)]
pub struct RateLimitDecider<S> {
    store: S,
    response_timeout: Duration,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl<S: CounterStore> RateLimitDecider<S> {
    pub fn builder(store: S) -> RateLimitDeciderBuilder<S> {
        RateLimitDeciderBuilder {
            store,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Count this request against `policy` and decide whether it is admitted.
    ///
    /// # Arguments
    ///
    /// * `policy`: The policy that applies to the request, or [None] if it is unrestricted.
    pub async fn decide(
        &self,
        policy: Option<&PolicyDescriptor>,
    ) -> Result<Decision, StoreUnavailable<S::Error>> {
        self.decide_counting(policy, &AtomicU32::new(0)).await
    }

    /// As [RateLimitDecider::decide], but gives up once `deadline` has passed.
    ///
    /// Giving up is reported as [StoreFailure::Cancelled], the request is not admitted.
    pub async fn decide_until(
        &self,
        policy: Option<&PolicyDescriptor>,
        deadline: Instant,
    ) -> Result<Decision, StoreUnavailable<S::Error>> {
        let attempts = AtomicU32::new(0);
        let budget = deadline.saturating_duration_since(Instant::now());
        match timeout(budget, self.decide_counting(policy, &attempts)).await {
            Ok(result) => result,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed);
                log::error!(
                    "Rate limit decision cancelled by caller deadline after {attempts} attempt(s)"
                );
                Err(StoreUnavailable {
                    attempts,
                    cause: StoreFailure::Cancelled,
                })
            }
        }
    }

    async fn decide_counting(
        &self,
        policy: Option<&PolicyDescriptor>,
        attempts: &AtomicU32,
    ) -> Result<Decision, StoreUnavailable<S::Error>> {
        let Some((policy, ttl)) = policy.and_then(|p| p.window_duration().map(|ttl| (p, ttl)))
        else {
            log::debug!("No enforceable rate limit policy ({policy:?}), allowing the request");
            return Ok(Decision::unenforced(policy.map_or(0, |p| p.limit)));
        };

        let key = CounterKey::for_policy(policy);
        let count = self.init_and_increment(&key, ttl, attempts).await?;
        let decision = Decision {
            admitted: count <= policy.limit,
            current_count: count,
            limit: policy.limit,
        };
        log::debug!(
            "Rate limit {}/{}: {count} of {}, admitted: {}",
            key.namespace,
            key.field,
            policy.limit,
            decision.admitted
        );
        Ok(decision)
    }

    async fn init_and_increment(
        &self,
        key: &CounterKey,
        ttl: Duration,
        attempts: &AtomicU32,
    ) -> Result<u64, StoreUnavailable<S::Error>> {
        let max_attempts = self.retry_attempts.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            attempts.store(attempt, Ordering::Relaxed);
            let call = self
                .store
                .init_and_increment(&key.namespace, &key.field, ttl);
            let cause = match timeout(self.response_timeout, call).await {
                Ok(Ok(count)) => return Ok(count),
                Ok(Err(e)) => StoreFailure::Backend(e),
                Err(_) => StoreFailure::Timeout(self.response_timeout),
            };
            if attempt >= max_attempts {
                log::error!(
                    "Counter store failed for {}/{} after {attempt} attempt(s): {cause}",
                    key.namespace,
                    key.field
                );
                return Err(StoreUnavailable {
                    attempts: attempt,
                    cause,
                });
            }
            log::warn!(
                "Counter store attempt {attempt}/{max_attempts} failed: {cause}, retrying in {:?}",
                self.retry_interval
            );
            sleep(self.retry_interval).await;
        }
    }
}

pub struct RateLimitDeciderBuilder<S> {
    store: S,
    response_timeout: Duration,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl<S: CounterStore> RateLimitDeciderBuilder<S> {
    /// How long to wait for a single store call before treating it as failed.
    ///
    /// Default is 2 seconds.
    pub fn response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Number of retries after the first failed store call.
    ///
    /// Default is 3, set to 0 to disable retries.
    pub fn retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    /// Fixed delay between store call attempts.
    ///
    /// Default is 2 seconds.
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn build(self) -> RateLimitDecider<S> {
        assert!(
            self.response_timeout > Duration::ZERO,
            "Response timeout must be non-zero"
        );
        RateLimitDecider {
            store: self.store,
            response_timeout: self.response_timeout,
            retry_attempts: self.retry_attempts,
            retry_interval: self.retry_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TimeUnit;
    use crate::store::{InMemoryStore, ResettableStore};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(10);

    #[derive(Debug, Error)]
    #[error("Mock store failure")]
    struct MockError;

    #[derive(Clone, Default)]
    struct MockStore(Arc<MockStoreInner>);

    #[derive(Default)]
    struct MockStoreInner {
        calls: AtomicU64,
        count: AtomicU64,
        failures: AtomicU32,
        hang: bool,
    }

    impl MockStore {
        fn failing(failures: u32) -> Self {
            let store = Self::default();
            store.0.failures.store(failures, Ordering::Relaxed);
            store
        }

        fn hanging() -> Self {
            Self(Arc::new(MockStoreInner {
                hang: true,
                ..Default::default()
            }))
        }

        fn calls(&self) -> u64 {
            self.0.calls.load(Ordering::Relaxed)
        }
    }

    impl CounterStore for MockStore {
        type Error = MockError;

        async fn init_and_increment(
            &self,
            _namespace: &str,
            _field: &str,
            _ttl: Duration,
        ) -> Result<u64, Self::Error> {
            self.0.calls.fetch_add(1, Ordering::Relaxed);
            if self.0.hang {
                std::future::pending::<()>().await;
            }
            let failing = self
                .0
                .failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |f| f.checked_sub(1))
                .is_ok();
            if failing {
                return Err(MockError);
            }
            Ok(self.0.count.fetch_add(1, Ordering::Relaxed) + 1)
        }
    }

    fn memory_decider() -> RateLimitDecider<InMemoryStore> {
        RateLimitDecider::builder(InMemoryStore::builder().with_gc_interval(None).build()).build()
    }

    #[actix_web::test]
    async fn test_allow_deny() {
        tokio::time::pause();
        let decider = memory_decider();
        let policy = PolicyDescriptor::per_seconds("K", 2, 10);
        for expected in 1..=2 {
            let decision = decider.decide(Some(&policy)).await.unwrap();
            assert!(decision.is_allowed());
            assert_eq!(decision.current_count, expected);
            assert_eq!(decision.limit, 2);
        }
        let decision = decider.decide(Some(&policy)).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.current_count, 3);
        assert_eq!(decision.remaining(), 0);
    }

    #[actix_web::test]
    async fn test_window_reset() {
        tokio::time::pause();
        let decider = memory_decider();
        let policy = PolicyDescriptor::per_seconds("K", 2, 10);
        for _ in 0..3 {
            decider.decide(Some(&policy)).await.unwrap();
        }
        tokio::time::advance(WINDOW).await;
        let decision = decider.decide(Some(&policy)).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.current_count, 1);
    }

    #[actix_web::test]
    async fn test_burst_across_window_boundary() {
        tokio::time::pause();
        let decider = memory_decider();
        let policy = PolicyDescriptor::per_seconds("K", 2, 10);
        assert!(decider.decide(Some(&policy)).await.unwrap().is_allowed());
        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert!(decider.decide(Some(&policy)).await.unwrap().is_allowed());
        tokio::time::advance(Duration::from_millis(100)).await;
        // A full quota is available as soon as the window closes
        assert!(decider.decide(Some(&policy)).await.unwrap().is_allowed());
        assert!(decider.decide(Some(&policy)).await.unwrap().is_allowed());
        assert!(decider.decide(Some(&policy)).await.unwrap().is_denied());
    }

    #[actix_web::test]
    async fn test_unenforceable_policies_never_touch_store() {
        let store = MockStore::default();
        let decider = RateLimitDecider::builder(store.clone()).build();
        let mut missing_unit = PolicyDescriptor::per_seconds("K", 5, 10);
        missing_unit.unit = None;
        let policies = [
            PolicyDescriptor::per_seconds("", 5, 10),
            PolicyDescriptor::per_seconds(" ", 5, 10),
            PolicyDescriptor::per_seconds("K", 5, 0),
            PolicyDescriptor::new("K", 5, -1, TimeUnit::Minutes),
            missing_unit,
        ];
        for policy in &policies {
            for _ in 0..3 {
                let decision = decider.decide(Some(policy)).await.unwrap();
                assert!(decision.is_allowed());
                assert_eq!(decision.current_count, 0);
                assert_eq!(decision.limit, 5);
            }
        }
        let decision = decider.decide(None).await.unwrap();
        assert_eq!(
            decision,
            Decision {
                admitted: true,
                current_count: 0,
                limit: 0
            }
        );
        assert_eq!(store.calls(), 0);
    }

    #[actix_web::test]
    async fn test_store_reset() {
        tokio::time::pause();
        let decider = memory_decider();
        let policy = PolicyDescriptor::per_seconds("K", 1, 10).with_scope("svc");
        assert!(decider.decide(Some(&policy)).await.unwrap().is_allowed());
        assert!(decider.decide(Some(&policy)).await.unwrap().is_denied());
        // Clearing the counter opens a new window straight away
        let key = CounterKey::for_policy(&policy);
        decider.store().remove(&key.namespace, &key.field).await.unwrap();
        let decision = decider.decide(Some(&policy)).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.current_count, 1);
    }

    #[actix_web::test]
    async fn test_scopes_are_independent() {
        tokio::time::pause();
        let decider = memory_decider();
        let a = PolicyDescriptor::per_seconds("/echo/{str}", 1, 10).with_scope("A");
        let b = PolicyDescriptor::per_seconds("/echo/{str}", 1, 10).with_scope("B");
        assert!(decider.decide(Some(&a)).await.unwrap().is_allowed());
        assert!(decider.decide(Some(&a)).await.unwrap().is_denied());
        assert!(decider.decide(Some(&b)).await.unwrap().is_allowed());
    }

    #[actix_web::test]
    async fn test_interleaved_admission() {
        tokio::time::pause();
        let decider = memory_decider();
        let policy = PolicyDescriptor::per_seconds("K", 4, 10);
        let decisions =
            futures::future::join_all((0..10).map(|_| decider.decide(Some(&policy)))).await;
        let admitted = decisions
            .into_iter()
            .filter(|d| d.as_ref().unwrap().is_allowed())
            .count();
        assert_eq!(admitted, 4);
    }

    #[test]
    fn test_concurrent_admission() {
        let decider = memory_decider();
        let policy = PolicyDescriptor::per_seconds("K", 25, 60);
        let admitted = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()
                        .unwrap();
                    rt.block_on(async {
                        for _ in 0..10 {
                            if decider.decide(Some(&policy)).await.unwrap().is_allowed() {
                                admitted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                });
            }
        });
        assert_eq!(admitted.load(Ordering::Relaxed), 25);
    }

    #[actix_web::test]
    async fn test_retry_then_success() {
        tokio::time::pause();
        let store = MockStore::failing(2);
        let decider = RateLimitDecider::builder(store.clone()).build();
        let policy = PolicyDescriptor::per_seconds("K", 5, 10);
        let decision = decider.decide(Some(&policy)).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.current_count, 1);
        assert_eq!(store.calls(), 3);
    }

    #[actix_web::test]
    async fn test_retries_exhausted() {
        tokio::time::pause();
        let store = MockStore::failing(u32::MAX);
        let decider = RateLimitDecider::builder(store.clone())
            .retry_attempts(2)
            .retry_interval(Duration::from_millis(500))
            .build();
        let policy = PolicyDescriptor::per_seconds("K", 5, 10);
        let start = Instant::now();
        let error = decider.decide(Some(&policy)).await.unwrap_err();
        assert_eq!(error.attempts, 3);
        assert!(matches!(error.cause, StoreFailure::Backend(MockError)));
        assert_eq!(store.calls(), 3);
        // Two fixed delays between three attempts, the timer may round up to the next tick
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1_050));
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_response_timeout() {
        tokio::time::pause();
        let store = MockStore::hanging();
        let decider = RateLimitDecider::builder(store.clone())
            .retry_attempts(0)
            .build();
        let policy = PolicyDescriptor::per_seconds("K", 5, 10);
        let error = decider.decide(Some(&policy)).await.unwrap_err();
        assert_eq!(error.attempts, 1);
        assert!(matches!(
            error.cause,
            StoreFailure::Timeout(limit) if limit == DEFAULT_RESPONSE_TIMEOUT
        ));
    }

    #[actix_web::test]
    async fn test_decide_until() {
        tokio::time::pause();
        let policy = PolicyDescriptor::per_seconds("K", 5, 10);

        let decider = memory_decider();
        let decision = decider
            .decide_until(Some(&policy), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert!(decision.is_allowed());

        let decider = RateLimitDecider::builder(MockStore::hanging()).build();
        let error = decider
            .decide_until(Some(&policy), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(error.attempts, 1);
        assert!(matches!(error.cause, StoreFailure::Cancelled));

        // An elapsed deadline does not block unenforced policies
        let decision = decider.decide_until(None, Instant::now()).await.unwrap();
        assert!(decision.is_allowed());
    }
}
