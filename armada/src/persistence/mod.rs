/// PostgreSQL tables for jobs and delete tasks.
///
/// [`PostgresJobStore`] and [`PostgresDeleteTaskStore`] implement the store
/// traits with conditional `UPDATE ... WHERE status = $expected` writes.
#[cfg(feature = "postgres")]
pub mod postgres;

/// Redis Streams broker and Redis status store.
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "postgres")]
pub use postgres::{ensure_schema, PostgresDeleteTaskStore, PostgresJobStore};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisBrokerError, RedisStatusStore, RedisStreamBroker};
