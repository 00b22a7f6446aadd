use crate::policy::CounterKey;
use crate::store::{CounterStore, ResettableStore};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// A [CounterStore] that uses [Dashmap](dashmap::DashMap) to keep counters in memory.
///
/// Only suitable when a single process enforces the limits.
#[derive(Clone)]
pub struct InMemoryStore {
    map: Arc<DashMap<CounterKey, Record>>,
    _gc_handle: Option<Arc<GcHandle>>,
}

struct Record {
    expiry: Instant,
    count: u64,
}

// Aborts the collector once the last clone of the store is gone.
struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryStore {
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn garbage_collector(
        map: Arc<DashMap<CounterKey, Record>>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, v| v.expiry > now);
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }

    fn key(namespace: &str, field: &str) -> CounterKey {
        CounterKey {
            namespace: namespace.to_owned(),
            field: field.to_owned(),
        }
    }
}

impl CounterStore for InMemoryStore {
    type Error = Infallible;

    async fn init_and_increment(
        &self,
        namespace: &str,
        field: &str,
        ttl: Duration,
    ) -> Result<u64, Self::Error> {
        let now = Instant::now();
        // A window too large to represent is capped, it will not expire in practice.
        let expiry = now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE);
        // The entry holds the shard lock, so creation and increment cannot interleave with
        // another caller for the same key.
        let mut record = self
            .map
            .entry(Self::key(namespace, field))
            .or_insert_with(|| Record { expiry, count: 0 });
        if record.expiry <= now {
            // An expired counter is replaced by a fresh one, which starts a new window.
            record.expiry = expiry;
            record.count = 0;
        }
        record.count = record.count.saturating_add(1);
        Ok(record.count)
    }
}

impl ResettableStore for InMemoryStore {
    async fn remove(&self, namespace: &str, field: &str) -> Result<(), Self::Error> {
        self.map.remove(&Self::key(namespace, field));
        Ok(())
    }
}

pub struct InMemoryStoreBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired counters.
    /// It must be spawned from within an actix (or tokio `LocalSet`) runtime.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryStore {
        let map = Arc::new(DashMap::<CounterKey, Record>::new());
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryStore::garbage_collector(
                map.clone(),
                gc_interval,
            )))
        });
        InMemoryStore {
            map,
            _gc_handle: gc_handle,
        }
    }
}
