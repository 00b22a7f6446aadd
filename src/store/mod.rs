#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

#[cfg(feature = "dashmap")]
pub use memory::{InMemoryStore, InMemoryStoreBuilder, DEFAULT_GC_INTERVAL_SECONDS};
use std::future::Future;
use std::time::Duration;

/// A shared counter store offering one atomic compound operation.
///
/// A store is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection managers already do so internally; there is
/// no need to wrap it twice.
pub trait CounterStore: Clone {
    type Error: std::error::Error + 'static;

    /// Initialise-if-absent and increment the counter at `(namespace, field)`.
    ///
    /// As a single indivisible operation with respect to any other call for the same key:
    ///
    /// 1. If there is no live counter, create one with a count of 0 that expires after `ttl`.
    /// 2. Increment the count by 1.
    ///
    /// Returns the count after the increment. The expiry is only ever set on creation, an
    /// existing counter keeps its original expiry.
    fn init_and_increment(
        &self,
        namespace: &str,
        field: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<u64, Self::Error>>;
}

/// Additional functions for a [CounterStore] that allow a counter to be cleared.
pub trait ResettableStore: CounterStore {
    /// Removes the counter for `(namespace, field)`, so that the next request opens a new window.
    fn remove(&self, namespace: &str, field: &str) -> impl Future<Output = Result<(), Self::Error>>;
}
