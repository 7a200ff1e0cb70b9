//! Redis-backed dispatch bus.
//!
//! Per channel kind there are these keys:
//! - `courier:dispatch:{channel}:ready:{priority}`: one list per priority level,
//!   producers push left and consumers take from the right
//! - `courier:dispatch:{channel}:processing`: list of tasks handed out but not acked
//! - `courier:dispatch:{channel}:delayed`: sorted set scored by due time (unix ms)
//!
//! Consumers drain `high` before `normal` before `low`. Delayed tasks are routed
//! to the ready list of their own priority when they come due. Delivery is
//! at-least-once: tasks left in `processing` by a crashed worker are moved
//! back by [`RedisMessageBus::recover_in_flight`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use courier_common::error::AppError;
use courier_common::types::{ChannelKind, DispatchTask, Priority};

use crate::ports::{Delivery, MessageBus};

const KEY_PREFIX: &str = "courier:dispatch";

/// Max delayed tasks promoted per poll.
const PROMOTE_BATCH: usize = 100;

// KEYS: delayed, ready:high, ready:normal, ready:low
const PROMOTE_SCRIPT: &str = r#"
local function ready_key(item)
    local ok, task = pcall(cjson.decode, item)
    if ok and task.priority == "high" then return KEYS[2] end
    if ok and task.priority == "low" then return KEYS[4] end
    return KEYS[3]
end

local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
for _, item in ipairs(due) do
    redis.call("ZREM", KEYS[1], item)
    redis.call("LPUSH", ready_key(item), item)
end
return #due
"#;

// KEYS: ready:high, ready:normal, ready:low, processing
const NEXT_SCRIPT: &str = r#"
for i = 1, #KEYS - 1 do
    local item = redis.call("LMOVE", KEYS[i], KEYS[#KEYS], "RIGHT", "LEFT")
    if item then return item end
end
return false
"#;

// KEYS: processing, ready:high, ready:normal, ready:low
const RECOVER_SCRIPT: &str = r#"
local function ready_key(item)
    local ok, task = pcall(cjson.decode, item)
    if ok and task.priority == "high" then return KEYS[2] end
    if ok and task.priority == "low" then return KEYS[4] end
    return KEYS[3]
end

local moved = 0
while true do
    local item = redis.call("RPOP", KEYS[1])
    if not item then break end
    redis.call("RPUSH", ready_key(item), item)
    moved = moved + 1
end
return moved
"#;

struct ChannelKeys {
    high: String,
    normal: String,
    low: String,
    processing: String,
    delayed: String,
}

impl ChannelKeys {
    fn new(channel: ChannelKind) -> Self {
        let ready = |priority: Priority| format!("{}:{}:ready:{}", KEY_PREFIX, channel, priority);
        Self {
            high: ready(Priority::High),
            normal: ready(Priority::Normal),
            low: ready(Priority::Low),
            processing: format!("{}:{}:processing", KEY_PREFIX, channel),
            delayed: format!("{}:{}:delayed", KEY_PREFIX, channel),
        }
    }

    fn ready(&self, priority: Priority) -> &str {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }
}

pub struct RedisMessageBus {
    redis: ConnectionManager,
    promote: redis::Script,
    next: redis::Script,
    recover: redis::Script,
}

impl RedisMessageBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            promote: redis::Script::new(PROMOTE_SCRIPT),
            next: redis::Script::new(NEXT_SCRIPT),
            recover: redis::Script::new(RECOVER_SCRIPT),
        }
    }

    /// Move tasks a previous run left in `processing` back to `ready`.
    ///
    /// Call once at startup, before workers begin consuming.
    pub async fn recover_in_flight(&self, channel: ChannelKind) -> Result<usize, AppError> {
        let keys = ChannelKeys::new(channel);
        let mut conn = self.redis.clone();

        let recovered: usize = self
            .recover
            .key(&keys.processing)
            .key(&keys.high)
            .key(&keys.normal)
            .key(&keys.low)
            .invoke_async(&mut conn)
            .await?;

        if recovered > 0 {
            tracing::info!(channel = %channel, recovered, "Recovered in-flight dispatch tasks");
        }
        Ok(recovered)
    }

    async fn promote_due(
        &self,
        conn: &mut ConnectionManager,
        keys: &ChannelKeys,
    ) -> Result<(), AppError> {
        let promoted: i64 = self
            .promote
            .key(&keys.delayed)
            .key(&keys.high)
            .key(&keys.normal)
            .key(&keys.low)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed dispatch tasks");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, task: &DispatchTask, delay: Option<Duration>) -> Result<(), AppError> {
        let keys = ChannelKeys::new(task.channel);
        let payload = serde_json::to_string(task)?;
        let mut conn = self.redis.clone();

        match delay {
            Some(delay) if !delay.is_zero() => {
                let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let _: () = conn.zadd(&keys.delayed, payload, due).await?;
            }
            _ => {
                let _: () = conn.lpush(keys.ready(task.priority), payload).await?;
            }
        }
        Ok(())
    }

    async fn next_task(&self, channel: ChannelKind) -> Result<Option<Delivery>, AppError> {
        let keys = ChannelKeys::new(channel);
        let mut conn = self.redis.clone();

        self.promote_due(&mut conn, &keys).await?;

        let raw: Option<String> = self
            .next
            .key(&keys.high)
            .key(&keys.normal)
            .key(&keys.low)
            .key(&keys.processing)
            .invoke_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<DispatchTask>(&raw) {
            Ok(task) => Ok(Some(Delivery { task, receipt: raw })),
            Err(e) => {
                tracing::error!(
                    channel = %channel,
                    error = %e,
                    "Dropping malformed dispatch task"
                );
                let _: () = conn.lrem(&keys.processing, 1, &raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        let keys = ChannelKeys::new(delivery.task.channel);
        let mut conn = self.redis.clone();
        let _: () = conn.lrem(&keys.processing, 1, &delivery.receipt).await?;
        Ok(())
    }
}
