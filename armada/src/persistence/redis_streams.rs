//! Redis-backed broker and status store.
//!
//! - **Topics** are streams written with `XADD`; each entry carries one
//!   `payload` field.
//! - **Consumer groups** use `XGROUP CREATE ... MKSTREAM` and `XREADGROUP`.
//! - **Re-claiming** idle pending entries uses `XAUTOCLAIM` (Redis 6.2+).
//!   Consumers keep their in-progress entries fresh with `XCLAIM ... JUSTID`.
//! - **Blocking reads** go over one dedicated connection per consumer name,
//!   opened on first read and reused after.
//! - **Delayed entries** sit in a sorted set `{topic}:delayed` scored by due
//!   time in milliseconds, and a Lua script moves due members onto the stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Value;
use uuid::Uuid;

use crate::broker::{Broker, Delivery, MessageId, ReadRequest};
use crate::status::StatusStore;

const PAYLOAD_FIELD: &str = "payload";
const PROMOTE_BATCH: usize = 256;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  local sep = string.find(member, '|', 1, true)
  redis.call('XADD', KEYS[2], '*', 'payload', string.sub(member, sep + 1))
  redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

#[derive(Debug, thiserror::Error)]
pub enum RedisBrokerError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("unexpected Redis reply: {0}")]
    Protocol(String),
}

fn command_error(command: &str) -> impl FnOnce(redis::RedisError) -> RedisBrokerError + '_ {
    move |e| RedisBrokerError::Command(format!("{command} failed: {e}"))
}

fn delayed_key(topic: &str) -> String {
    format!("{topic}:delayed")
}

/// [`Broker`] on Redis Streams.
#[derive(Clone)]
pub struct RedisStreamBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// Connections reserved for `XREADGROUP ... BLOCK`, keyed by consumer.
    blocking: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
    promote: redis::Script,
}

impl std::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("addr", &self.client.get_connection_info().addr)
            .field("blocking_connections", &self.blocking.lock().len())
            .finish_non_exhaustive()
    }
}

impl RedisStreamBroker {
    /// Connects to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, RedisBrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisBrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(HashMap::new())),
            promote: redis::Script::new(PROMOTE_SCRIPT),
        })
    }

    /// The consumer's blocking-read connection, opened on first use.
    async fn blocking_connection(
        &self,
        consumer: &str,
    ) -> Result<MultiplexedConnection, RedisBrokerError> {
        if let Some(conn) = self.blocking.lock().get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisBrokerError::Connection(e.to_string()))?;
        self.blocking
            .lock()
            .insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    /// Re-claims entries idle past `claim_idle`, with their delivery counts.
    async fn claim_idle(&self, request: &ReadRequest) -> Result<Vec<Delivery>, RedisBrokerError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&request.topic)
            .arg(&request.group)
            .arg(&request.consumer)
            .arg(request.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(request.count)
            .query_async(&mut conn)
            .await
            .map_err(command_error("XAUTOCLAIM"))?;

        // [next-start, [entries...], (deleted ids, Redis 7)]
        let entries = match reply {
            Value::Bulk(parts) => match parts.into_iter().nth(1) {
                Some(Value::Bulk(entries)) => entries,
                _ => return Ok(Vec::new()),
            },
            other => return Err(RedisBrokerError::Protocol(format!("XAUTOCLAIM: {other:?}"))),
        };

        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            // Entries trimmed from the stream come back as nil or without fields.
            let (id, payload) = match parse_entry(entry) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(topic = %request.topic, "skipping unreadable claimed entry: {err}");
                    continue;
                }
            };
            let delivery_count = self.delivery_count(request, &id).await?;
            deliveries.push(Delivery {
                id: MessageId(id),
                payload,
                delivery_count,
            });
        }
        Ok(deliveries)
    }

    async fn delivery_count(&self, request: &ReadRequest, id: &str) -> Result<u32, RedisBrokerError> {
        let mut conn = self.conn.clone();
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&request.topic)
            .arg(&request.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(command_error("XPENDING"))?;
        Ok(pending
            .first()
            .map(|(_, _, _, count)| u32::try_from(*count).unwrap_or(u32::MAX))
            .unwrap_or(1))
    }

    async fn read_new(&self, request: &ReadRequest) -> Result<Vec<Delivery>, RedisBrokerError> {
        // A blocking read stalls every command pipelined behind it, so it gets
        // its own connection.
        let mut conn = self.blocking_connection(&request.consumer).await?;
        let block_ms = request.block.as_millis().max(1) as u64;
        let reply: Result<Value, _> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&request.group)
            .arg(&request.consumer)
            .arg("COUNT")
            .arg(request.count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&request.topic)
            .arg(">")
            .query_async(&mut conn)
            .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                // Reconnect on the next poll.
                self.blocking.lock().remove(&request.consumer);
                return Err(command_error("XREADGROUP")(err));
            }
        };

        // nil on timeout, otherwise [[stream, [entries...]]]
        let streams = match reply {
            Value::Nil => return Ok(Vec::new()),
            Value::Bulk(streams) => streams,
            other => return Err(RedisBrokerError::Protocol(format!("XREADGROUP: {other:?}"))),
        };
        let mut deliveries = Vec::new();
        for stream in streams {
            let Value::Bulk(parts) = stream else { continue };
            let Some(Value::Bulk(entries)) = parts.into_iter().nth(1) else {
                continue;
            };
            for entry in entries {
                let (id, payload) = parse_entry(entry)?;
                deliveries.push(Delivery {
                    id: MessageId(id),
                    payload,
                    delivery_count: 1,
                });
            }
        }
        Ok(deliveries)
    }
}

/// Parses `[id, [field, value, ...]]` into the id and the payload field.
fn parse_entry(entry: Value) -> Result<(String, String), RedisBrokerError> {
    let Value::Bulk(mut parts) = entry else {
        return Err(RedisBrokerError::Protocol("stream entry is not an array".into()));
    };
    if parts.len() < 2 {
        return Err(RedisBrokerError::Protocol("stream entry too short".into()));
    }
    let fields = parts.remove(1);
    let id = match &parts[0] {
        Value::Data(data) => String::from_utf8_lossy(data).into_owned(),
        other => return Err(RedisBrokerError::Protocol(format!("entry id: {other:?}"))),
    };
    let Value::Bulk(fields) = fields else {
        return Err(RedisBrokerError::Protocol(format!("fields of {id}")));
    };
    for pair in fields.chunks(2) {
        if let [Value::Data(key), Value::Data(value)] = pair {
            if key.as_slice() == PAYLOAD_FIELD.as_bytes() {
                return Ok((id, String::from_utf8_lossy(value).into_owned()));
            }
        }
    }
    Err(RedisBrokerError::Protocol(format!("entry {id} has no payload field")))
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn append(&self, topic: &str, payload: String) -> anyhow::Result<MessageId> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(command_error("XADD"))?;
        Ok(MessageId(id))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisBrokerError::Command(format!("XGROUP CREATE failed: {e}")).into()),
        }
    }

    async fn read_group(&self, request: ReadRequest) -> anyhow::Result<Vec<Delivery>> {
        let claimed = self.claim_idle(&request).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }
        Ok(self.read_new(&request).await?)
    }

    async fn ack(&self, topic: &str, group: &str, id: &MessageId) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(topic)
            .arg(group)
            .arg(&id.0)
            .query_async(&mut conn)
            .await
            .map_err(command_error("XACK"))?;
        Ok(acked > 0)
    }

    async fn touch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(topic).arg(group).arg(consumer).arg(0);
        for id in ids {
            cmd.arg(&id.0);
        }
        // JUSTID leaves the delivery count alone; acked ids are skipped.
        let _: Value = cmd
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(command_error("XCLAIM"))?;
        Ok(())
    }

    async fn schedule(
        &self,
        topic: &str,
        payload: String,
        due_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        // Members must be unique; the prefix is stripped on promotion.
        let member = format!("{}|{payload}", Uuid::now_v7());
        let _: i64 = redis::cmd("ZADD")
            .arg(delayed_key(topic))
            .arg(due_at.timestamp_millis())
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZADD"))?;
        Ok(())
    }

    async fn promote_due(&self, topic: &str, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .promote
            .key(delayed_key(topic))
            .key(topic)
            .arg(now.timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("promote script"))?;
        Ok(moved)
    }

    async fn topic_exists(&self, topic: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(topic)
            .query_async(&mut conn)
            .await
            .map_err(command_error("EXISTS"))?;
        Ok(exists)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error("PING"))?;
        Ok(())
    }
}

/// [`StatusStore`] on plain Redis strings with `PX` expiry.
#[derive(Clone)]
pub struct RedisStatusStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStatusStore").finish_non_exhaustive()
    }
}

impl RedisStatusStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, RedisBrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisBrokerError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    fn set_cmd(key: &str, value: String, ttl: Option<Duration>) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("GET"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = Self::set_cmd(key, value, ttl)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX replies OK when written and nil otherwise.
        let written: Option<String> = Self::set_cmd(key, value, ttl)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET NX"))?;
        Ok(written.is_some())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("DEL"))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("EXISTS"))?;
        Ok(exists)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error("PING"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_entry() {
        let entry = Value::Bulk(vec![
            data("1700000000000-0"),
            Value::Bulk(vec![data("payload"), data("{\"id\":1}")]),
        ]);
        let (id, payload) = parse_entry(entry).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(payload, "{\"id\":1}");
    }

    #[test]
    fn test_parse_entry_without_payload() {
        let entry = Value::Bulk(vec![
            data("1-0"),
            Value::Bulk(vec![data("other"), data("x")]),
        ]);
        assert!(matches!(
            parse_entry(entry),
            Err(RedisBrokerError::Protocol(_))
        ));
    }

    #[test]
    fn test_delayed_key() {
        assert_eq!(delayed_key("install"), "install:delayed");
    }

    /// Requires a local Redis 6.2+.
    /// Run with: `cargo test --features redis -- --ignored redis_round_trip`
    #[tokio::test]
    #[ignore]
    async fn redis_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let broker = RedisStreamBroker::connect(&url).await.unwrap();
        let topic = format!("armada-test-{}", Uuid::now_v7());

        broker.ensure_group(&topic, "workers").await.unwrap();
        broker.ensure_group(&topic, "workers").await.unwrap();
        broker.append(&topic, "hello".into()).await.unwrap();

        let request = ReadRequest {
            topic: topic.clone(),
            group: "workers".into(),
            consumer: "c1".into(),
            count: 10,
            block: Duration::from_millis(100),
            claim_idle: Duration::from_secs(60),
        };
        let batch = broker.read_group(request.clone()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "hello");
        broker
            .touch(&topic, "workers", "c1", &[batch[0].id.clone()])
            .await
            .unwrap();
        assert!(broker.ack(&topic, "workers", &batch[0].id).await.unwrap());

        // Polling again reuses the consumer's blocking connection.
        assert!(broker.read_group(request).await.unwrap().is_empty());
        assert_eq!(broker.blocking.lock().len(), 1);

        broker
            .schedule(&topic, "later|with|pipes".into(), Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(broker.promote_due(&topic, Utc::now()).await.unwrap(), 1);
    }
}
