//! Key-value store with per-key TTL holding the last-known status of tasks,
//! jobs, bulk runs, and events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Key layout shared by every component writing to the status store.
pub mod keys {
    use crate::job::Jid;
    use crate::task::TaskId;

    pub fn task_status(id: TaskId) -> String {
        format!("armada:task:status:{id}")
    }

    pub fn task_payload(id: TaskId) -> String {
        format!("armada:task:payload:{id}")
    }

    pub fn task_stop(id: TaskId) -> String {
        format!("armada:task:stop:{id}")
    }

    pub fn job_status(jid: &Jid) -> String {
        format!("armada:job:status:{jid}")
    }

    pub fn bulk_run(run_id: impl std::fmt::Display) -> String {
        format!("armada:bulk:{run_id}")
    }

    pub fn event_last(key: &str) -> String {
        format!("armada:event:last:{key}")
    }
}

/// Storage backend for last-known statuses.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Writes `value`, replacing any previous value. `None` keeps it forever.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Writes only when the key is absent. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> anyhow::Result<bool>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Verifies the backend is reachable.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Typed JSON helpers over any [`StatusStore`].
#[async_trait]
pub trait StatusStoreExt: StatusStore {
    async fn get_json<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> anyhow::Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw, ttl).await
    }
}

impl<S: StatusStore + ?Sized> StatusStoreExt for S {}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local status store. Expired keys are dropped lazily on access
/// and by [`InMemoryStatusStore::purge_expired`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryStatusStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired key and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStatusStore::new();
        store.set("a", "1".into(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.exists("a").await.unwrap());
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStatusStore::new();
        store
            .set("short", "x".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("long", "y".into(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = InMemoryStatusStore::new();
        assert!(store.set_if_absent("k", "first".into(), None).await.unwrap());
        assert!(!store.set_if_absent("k", "second".into(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_set_if_absent_replaces_expired() {
        let store = InMemoryStatusStore::new();
        store
            .set("k", "old".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.set_if_absent("k", "new".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = InMemoryStatusStore::new();
        let probe = Probe {
            name: "node".into(),
            count: 3,
        };
        store.set_json("p", &probe, None).await.unwrap();
        let loaded: Option<Probe> = store.get_json("p").await.unwrap();
        assert_eq!(loaded, Some(probe));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryStatusStore::new();
        for i in 0..5 {
            store
                .set(&format!("k{i}"), "v".into(), Some(Duration::from_millis(5)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired(), 5);
        assert!(store.is_empty());
    }
}
