//! Redis-backed idempotency locks.
//!
//! `SET key token NX PX ttl` takes the lock with a token unique to this
//! acquisition; release deletes it only when the stored token still matches,
//! so an expired-and-retaken lock is left alone.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use courier_common::error::AppError;

use crate::ports::{IdempotencyLocks, LockToken};

const KEY_PREFIX: &str = "courier:idempotency";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisIdempotencyLocks {
    redis: ConnectionManager,
    release: redis::Script,
}

impl RedisIdempotencyLocks {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    fn lock_key(key: &str) -> String {
        format!("{}:{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl IdempotencyLocks for RedisIdempotencyLocks {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, AppError> {
        let token = LockToken::generate();
        let mut conn = self.redis.clone();
        // Some("OK") when set, None when the key already exists
        let result: Option<String> = redis::cmd("SET")
            .arg(Self::lock_key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        if result.is_none() {
            tracing::debug!(idempotency_key = %key, "Idempotency lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .release
            .key(Self::lock_key(key))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            tracing::debug!(idempotency_key = %key, "Idempotency lock expired before release");
        }
        Ok(())
    }
}
