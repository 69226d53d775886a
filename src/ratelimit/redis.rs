//! Redis-backed counter store.

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::Script;
use tracing::{info, trace};

use super::key::CounterKey;
use super::store::{CounterStore, Increment, StoreError};

/// INCR, set the expiry on the first hit of a window, report the TTL.
/// Runs as one script so no other client sees the key without an expiry.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
return {count, ttl}
"#;

/// A [`CounterStore`] on a Redis server.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!("Connected to Redis counter store");

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &CounterKey, window_seconds: u64) -> Result<Increment, StoreError> {
        let mut conn = self.conn.clone();

        let (count, ttl): (i64, i64) = self
            .script
            .key(key.as_str())
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        trace!(key = %key, count = count, ttl = ttl, "Incremented Redis counter");

        Ok(Increment {
            count: count.max(0) as u64,
            // -1 means the key has no expiry, -2 that it is already gone
            ttl_seconds: u64::try_from(ttl).ok(),
        })
    }
}
