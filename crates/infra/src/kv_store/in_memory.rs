use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use camwatch_core::{Clock, SystemClock};

use super::r#trait::{resolve_rank_range, KvError, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: JsonValue,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory key-value + sorted-set store.
///
/// Intended for tests/dev. TTLs are evaluated lazily against the injected
/// [`Clock`], so advancing a `ManualClock` past a key's expiry makes the key
/// disappear on the next read exactly as it would in Redis.
pub struct InMemoryKvStore {
    clock: Arc<dyn Clock>,
    values: RwLock<HashMap<String, Entry>>,
    sorted_sets: RwLock<HashMap<String, HashMap<String, f64>>>,
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKvStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            values: RwLock::new(HashMap::new()),
            sorted_sets: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Remaining TTL of a key, `None` when the key is missing or has no expiry.
    pub fn ttl(&self, key: &str) -> Option<chrono::Duration> {
        let now = self.clock.now();
        let values = self.values.read().ok()?;
        let entry = values.get(key)?;
        match entry.expires_at {
            Some(at) if at > now => Some(at - now),
            _ => None,
        }
    }

    fn poisoned() -> KvError {
        KvError::Unavailable("lock poisoned".to_string())
    }

    /// Members of a sorted set ordered by (score, member).
    fn ordered(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, KvError> {
        let now = self.clock.now();
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;

        let expired = matches!(values.get(key), Some(Entry { expires_at: Some(at), .. }) if *at <= now);
        if expired {
            values.remove(key);
            return Ok(None);
        }

        Ok(values.get(key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &JsonValue,
        expire: Option<Duration>,
    ) -> Result<(), KvError> {
        let expires_at = match expire {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| KvError::Command(format!("invalid expiry: {e}")))?;
                Some(self.clock.now() + ttl)
            }
            None => None,
        };

        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        values.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        let now = self.clock.now();
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        match values.remove(key) {
            Some(Entry { expires_at: Some(at), .. }) if at <= now => Ok(0),
            Some(_) => Ok(1),
            None => {
                drop(values);
                let mut sets = self.sorted_sets.write().map_err(|_| Self::poisoned())?;
                Ok(u64::from(sets.remove(key).is_some()))
            }
        }
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> Result<u64, KvError> {
        let mut sets = self.sorted_sets.write().map_err(|_| Self::poisoned())?;
        let set = sets.entry(key.to_string()).or_default();
        let mut added = 0;
        for (member, score) in members {
            if set.insert(member.clone(), *score).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, KvError> {
        let mut sets = self.sorted_sets.write().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = u64::from(set.remove(member).is_some());
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, KvError> {
        let sets = self.sorted_sets.read().map_err(|_| Self::poisoned())?;
        Ok(sets.get(key).and_then(|s| s.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let sets = self.sorted_sets.read().map_err(|_| Self::poisoned())?;
        Ok(sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        let sets = self.sorted_sets.read().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let ordered = Self::ordered(set);
        Ok(match resolve_rank_range(ordered.len(), start, stop) {
            Some((s, e)) => ordered[s..=e].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        let sets = self.sorted_sets.read().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut ordered = Self::ordered(set);
        ordered.reverse();
        Ok(match resolve_rank_range(ordered.len(), start, stop) {
            Some((s, e)) => ordered[s..=e].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        let sets = self.sorted_sets.read().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(Self::ordered(set)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(m, _)| m)
            .collect())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError> {
        let mut sets = self.sorted_sets.write().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score < min || *score > max);
        let removed = (before - set.len()) as u64;
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> Result<u64, KvError> {
        let mut sets = self.sorted_sets.write().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };
        let ordered = Self::ordered(set);
        let Some((s, e)) = resolve_rank_range(ordered.len(), start, stop) else {
            return Ok(0);
        };
        for (member, _) in &ordered[s..=e] {
            set.remove(member);
        }
        if set.is_empty() {
            sets.remove(key);
        }
        Ok((e - s + 1) as u64)
    }

    async fn zpopmax(&self, key: &str) -> Result<Vec<(String, f64)>, KvError> {
        let mut sets = self.sorted_sets.write().map_err(|_| Self::poisoned())?;
        let Some(set) = sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let Some((member, score)) = Self::ordered(set).pop() else {
            return Ok(Vec::new());
        };
        set.remove(&member);
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(vec![(member, score)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camwatch_core::ManualClock;
    use serde_json::json;

    fn store_with_clock() -> (InMemoryKvStore, ManualClock) {
        let clock = ManualClock::starting_now();
        (InMemoryKvStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn members(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(m, s)| (m.to_string(), *s)).collect()
    }

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let (store, clock) = store_with_clock();

        store
            .set("k", &json!({"a": 1}), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert!(store.ttl("k").is_some());

        clock.advance_secs(9);
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance_secs(1);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_without_expiry_clears_previous_ttl() {
        let (store, clock) = store_with_clock();

        store.set("k", &json!(1), Some(Duration::from_secs(5))).await.unwrap();
        store.set("k", &json!(2), None).await.unwrap();

        clock.advance_secs(60);
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
        assert!(store.ttl("k").is_none());
    }

    #[tokio::test]
    async fn delete_reports_removed_count() {
        let store = InMemoryKvStore::new();
        store.set("k", &json!("v"), None).await.unwrap();

        assert_eq!(store.delete("k").await.unwrap(), 1);
        assert_eq!(store.delete("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sorted_set_orders_by_score_then_member() {
        let store = InMemoryKvStore::new();
        let added = store
            .zadd("z", &members(&[("c", 2.0), ("b", 1.0), ("a", 1.0)]))
            .await
            .unwrap();
        assert_eq!(added, 3);

        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.zrevrange("z", 0, 0).await.unwrap(), vec!["c"]);
        assert_eq!(store.zcard("z").await.unwrap(), 3);
        assert_eq!(store.zscore("z", "c").await.unwrap(), Some(2.0));

        // Re-adding updates the score without counting as new.
        assert_eq!(store.zadd("z", &members(&[("a", 5.0)])).await.unwrap(), 0);
        assert_eq!(store.zrange("z", -1, -1).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn score_ranges_are_inclusive() {
        let store = InMemoryKvStore::new();
        store
            .zadd("z", &members(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]))
            .await
            .unwrap();

        assert_eq!(store.zrangebyscore("z", 1.0, 2.0).await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            store.zremrangebyscore("z", f64::NEG_INFINITY, 2.0).await.unwrap(),
            2
        );
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn remove_by_rank_drops_lowest_scores() {
        let store = InMemoryKvStore::new();
        store
            .zadd("z", &members(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]))
            .await
            .unwrap();

        assert_eq!(store.zremrangebyrank("z", 0, 1).await.unwrap(), 2);
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.zremrangebyrank("z", 5, 9).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zpopmax_and_zrem_on_missing_keys() {
        let store = InMemoryKvStore::new();
        assert!(store.zpopmax("missing").await.unwrap().is_empty());
        assert_eq!(store.zrem("missing", "x").await.unwrap(), 0);

        store
            .zadd("z", &members(&[("a", 1.0), ("b", 2.0)]))
            .await
            .unwrap();
        assert_eq!(store.zpopmax("z").await.unwrap(), vec![("b".to_string(), 2.0)]);
        assert_eq!(store.zrem("z", "a").await.unwrap(), 1);
        assert_eq!(store.zcard("z").await.unwrap(), 0);
    }
}
