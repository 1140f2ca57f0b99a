use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Key-value store operation error.
///
/// These are **infrastructure errors**. The job subsystem propagates them
/// unchanged and never retries a store call on its own: retrying is a
/// job-level concept, not a store-call concept.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Abstract key-value + sorted-set store.
///
/// The capability surface is the subset of Redis that the job subsystem
/// needs. Values are structured JSON; sorted-set members are strings scored
/// by `f64`.
///
/// ## Semantics implementations must follow
///
/// - `set` with `expire = None` stores the value **without** a TTL (clearing
///   any previous TTL on the key).
/// - Rank arguments (`zrange`, `zrevrange`, `zremrangebyrank`) are inclusive
///   and accept negative indices counting from the end (`-1` = last).
/// - Score ranges are inclusive; `f64::NEG_INFINITY` / `f64::INFINITY` are
///   valid bounds.
/// - Members with equal scores are ordered lexicographically.
///
/// Each call must be atomic on its own. Nothing here offers multi-call
/// transactions; callers composing several calls accept the race windows.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, KvError>;

    async fn set(
        &self,
        key: &str,
        value: &JsonValue,
        expire: Option<Duration>,
    ) -> Result<(), KvError>;

    /// Delete a key; returns the number of keys removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64, KvError>;

    /// Add or update members; returns the number of newly added members.
    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> Result<u64, KvError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, KvError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, KvError>;

    async fn zcard(&self, key: &str) -> Result<u64, KvError>;

    /// Members by ascending score within the rank range.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;

    /// Members by descending score within the rank range.
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, KvError>;

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError>;

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64, KvError>;

    /// Remove and return the highest-scored member, if any.
    async fn zpopmax(&self, key: &str) -> Result<Vec<(String, f64)>, KvError>;
}

#[async_trait::async_trait]
impl<S> KvStore for Arc<S>
where
    S: KvStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, KvError> {
        (**self).get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &JsonValue,
        expire: Option<Duration>,
    ) -> Result<(), KvError> {
        (**self).set(key, value, expire).await
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        (**self).delete(key).await
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> Result<u64, KvError> {
        (**self).zadd(key, members).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, KvError> {
        (**self).zrem(key, member).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, KvError> {
        (**self).zscore(key, member).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        (**self).zcard(key).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        (**self).zrange(key, start, stop).await
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        (**self).zrevrange(key, start, stop).await
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        (**self).zrangebyscore(key, min, max).await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError> {
        (**self).zremrangebyscore(key, min, max).await
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64, KvError> {
        (**self).zremrangebyrank(key, start, stop).await
    }

    async fn zpopmax(&self, key: &str) -> Result<Vec<(String, f64)>, KvError> {
        (**self).zpopmax(key).await
    }
}

/// Resolve a Redis-style inclusive rank range against a set of `len` members.
///
/// Returns `None` when the range selects nothing.
pub fn resolve_rank_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let stop = if stop < 0 { len_i + stop } else { stop.min(len_i - 1) };
    if start > stop || start >= len_i || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
