//! Redis-backed key-value store.
//!
//! - **Values**: stored as JSON strings (`SET key <json> [PX ms]`).
//! - **Legacy payloads**: anything that is not valid JSON is surfaced as
//!   `JsonValue::String`, so older plain-text writes stay readable.
//! - **Connection**: a single multiplexed `ConnectionManager`, which
//!   reconnects on its own. Each trait call maps to exactly one Redis command.

use std::time::Duration;

use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;
use tracing::instrument;

use super::r#trait::{KvError, KvStore};

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Connect to Redis (e.g. `redis://localhost:6379/0`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn query<T: redis::FromRedisValue>(
        &self,
        name: &str,
        cmd: &redis::Cmd,
    ) -> Result<T, KvError> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(name, e))
    }
}

fn map_redis_error(command: &str, err: redis::RedisError) -> KvError {
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        KvError::Connection(format!("{command} failed: {err}"))
    } else {
        KvError::Command(format!("{command} failed: {err}"))
    }
}

/// Format a score bound the way `ZRANGEBYSCORE` expects it.
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn decode_value(raw: String) -> JsonValue {
    serde_json::from_str(&raw).unwrap_or(JsonValue::String(raw))
}

#[async_trait::async_trait]
impl KvStore for RedisKvStore {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, KvError> {
        let raw: Option<String> = self.query("GET", redis::cmd("GET").arg(key)).await?;
        Ok(raw.map(decode_value))
    }

    #[instrument(skip(self, value), err)]
    async fn set(
        &self,
        key: &str,
        value: &JsonValue,
        expire: Option<Duration>,
    ) -> Result<(), KvError> {
        let payload =
            serde_json::to_string(value).map_err(|e| KvError::Serialization(e.to_string()))?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if let Some(ttl) = expire {
            // PX 0 is rejected by Redis.
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        let _: () = self.query("SET", &cmd).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        self.query("DEL", redis::cmd("DEL").arg(key)).await
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> Result<u64, KvError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (member, score) in members {
            cmd.arg(*score).arg(member);
        }
        self.query("ZADD", &cmd).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, KvError> {
        self.query("ZREM", redis::cmd("ZREM").arg(key).arg(member))
            .await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, KvError> {
        self.query("ZSCORE", redis::cmd("ZSCORE").arg(key).arg(member))
            .await
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        self.query("ZCARD", redis::cmd("ZCARD").arg(key)).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        self.query(
            "ZRANGE",
            redis::cmd("ZRANGE").arg(key).arg(start).arg(stop),
        )
        .await
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        self.query(
            "ZREVRANGE",
            redis::cmd("ZREVRANGE").arg(key).arg(start).arg(stop),
        )
        .await
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        self.query(
            "ZRANGEBYSCORE",
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(min))
                .arg(score_arg(max)),
        )
        .await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError> {
        self.query(
            "ZREMRANGEBYSCORE",
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(min))
                .arg(score_arg(max)),
        )
        .await
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64, KvError> {
        self.query(
            "ZREMRANGEBYRANK",
            redis::cmd("ZREMRANGEBYRANK").arg(key).arg(start).arg(stop),
        )
        .await
    }

    async fn zpopmax(&self, key: &str) -> Result<Vec<(String, f64)>, KvError> {
        self.query("ZPOPMAX", redis::cmd("ZPOPMAX").arg(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bounds_use_redis_infinity_syntax() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(1700000000.5), "1700000000.5");
    }

    #[test]
    fn non_json_payloads_decode_as_strings() {
        assert_eq!(decode_value("3".to_string()), serde_json::json!(3));
        assert_eq!(
            decode_value(r#"{"count":2}"#.to_string()),
            serde_json::json!({"count": 2})
        );
        assert_eq!(
            decode_value("not json".to_string()),
            JsonValue::String("not json".to_string())
        );
    }
}
