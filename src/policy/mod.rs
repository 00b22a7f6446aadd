mod key;

pub use key::CounterKey;
use std::time::Duration;

/// Granularity of a [PolicyDescriptor] window.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert `amount` of this unit into a [Duration], saturating on overflow.
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(amount),
            Self::Microseconds => Duration::from_micros(amount),
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
            Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            Self::Hours => Duration::from_secs(amount.saturating_mul(60 * 60)),
            Self::Days => Duration::from_secs(amount.saturating_mul(60 * 60 * 24)),
        }
    }
}

/// A single rate limit rule, built by the caller for each guarded operation.
///
/// The fields are public so that a descriptor can be assembled from any source of configuration,
/// including an invalid one: a malformed descriptor is never rejected at construction time, the
/// [RateLimitDecider](crate::RateLimitDecider) admits it without touching the store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PolicyDescriptor {
    /// Groups counters, e.g. per application. May be empty.
    pub scope_id: String,
    /// Identifies the counter within the scope.
    pub limit_key: String,
    /// The total requests to be allowed within the window.
    pub limit: u64,
    /// Length of the window, in `unit`s.
    pub window: i64,
    /// Unit of `window`.
    pub unit: Option<TimeUnit>,
}

impl PolicyDescriptor {
    pub fn new(limit_key: impl Into<String>, limit: u64, window: i64, unit: TimeUnit) -> Self {
        Self {
            scope_id: String::new(),
            limit_key: limit_key.into(),
            limit,
            window,
            unit: Some(unit),
        }
    }

    /// A descriptor whose window is measured in seconds.
    pub fn per_seconds(limit_key: impl Into<String>, limit: u64, seconds: i64) -> Self {
        Self::new(limit_key, limit, seconds, TimeUnit::Seconds)
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = scope_id.into();
        self
    }

    /// Whether this descriptor can be enforced at all.
    ///
    /// A blank key, a non-positive window or a missing unit make the policy unenforceable.
    pub fn is_valid(&self) -> bool {
        self.window_duration().is_some()
    }

    /// The window as a [Duration], or [None] if the descriptor is malformed.
    pub fn window_duration(&self) -> Option<Duration> {
        if self.limit_key.trim().is_empty() || self.window <= 0 {
            return None;
        }
        self.unit.map(|unit| unit.to_duration(self.window as u64))
    }
}
