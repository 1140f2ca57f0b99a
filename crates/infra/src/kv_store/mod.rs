//! Key-value + sorted-set store boundary.
//!
//! The job subsystem talks to its backing store only through [`KvStore`].
//! This module ships an in-memory implementation (tests/dev) and a Redis
//! implementation behind the `redis` feature (production).

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod r#trait;

pub use in_memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisKvStore;
pub use r#trait::{resolve_rank_range, KvError, KvStore};
