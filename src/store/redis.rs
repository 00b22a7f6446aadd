use crate::store::{CounterStore, ResettableStore};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error("Counter field was left without an expiry")]
    MissingTtl,
}

/// A [CounterStore] that keeps counters in Redis.
///
/// Each namespace is a Redis hash and each counter is a field of that hash with its own expiry,
/// which requires Redis 7.4 or later (`HPEXPIRE`).
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisStore {
    /// Create a RedisStore Builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use qps_limiter::store::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key<'t>(&self, namespace: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(namespace),
            Some(prefix) => Cow::Owned(format!("{prefix}{namespace}")),
        }
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all namespaces given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix
    /// avoids collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisStore {
        RedisStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
        }
    }
}

impl CounterStore for RedisStore {
    type Error = Error;

    async fn init_and_increment(
        &self,
        namespace: &str,
        field: &str,
        ttl: Duration,
    ) -> Result<u64, Self::Error> {
        let key = self.make_key(namespace);
        // Redis deletes a field immediately given a zero expiry
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Create the field at 0 if absent, and increment it
            .cmd("HINCRBY")
            .arg(key.as_ref())
            .arg(field)
            .arg(1)
            // Set the field to expire (only if it doesn't already have an expiry)
            .cmd("HPEXPIRE")
            .arg(key.as_ref())
            .arg(millis)
            .arg("NX")
            .arg("FIELDS")
            .arg(1)
            .arg(field)
            .ignore()
            // Return time-to-live of the field
            .cmd("HPTTL")
            .arg(key.as_ref())
            .arg("FIELDS")
            .arg(1)
            .arg(field);

        let mut con = self.connection.clone();
        let (count, ttls): (u64, Vec<i64>) = pipe.query_async(&mut con).await?;
        match ttls.first() {
            Some(ttl) if *ttl >= 0 => Ok(count),
            _ => Err(Error::MissingTtl),
        }
    }
}

impl ResettableStore for RedisStore {
    /// Note that the key prefix (if set) is automatically included, you do not need to prepend
    /// it yourself.
    async fn remove(&self, namespace: &str, field: &str) -> Result<(), Self::Error> {
        let key = self.make_key(namespace);
        let mut con = self.connection.clone();
        let () = con.hdel(key.as_ref(), field).await?;
        Ok(())
    }
}
