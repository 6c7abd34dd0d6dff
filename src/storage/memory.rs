//! In-process store.
//!
//! Clients sharing one `MemoryStore` behave like tabs connected to the same
//! realtime database: every write fans out to every subscriber.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::tree::TreeCore;
use super::{RemoteStore, StoreResult, Subscription};

/// Default capacity of each subscription channel
const DEFAULT_CAPACITY: usize = 64;

pub struct MemoryStore {
    core: TreeCore,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            core: TreeCore::new(capacity),
        }
    }

    /// Number of writes applied so far
    pub fn write_count(&self) -> u64 {
        self.core.write_count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn set(&self, path: &str, value: Value) -> StoreResult<i64> {
        self.core.set(path, value)
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        self.core.get(path)
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<i64> {
        self.core.update(path, fields)
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        self.core.remove(path)
    }

    fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        self.core.subscribe(path)
    }

    fn server_time(&self) -> i64 {
        self.core.server_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WriteTimestamp;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_resolves_sentinel() {
        let store = MemoryStore::new();
        let written_at = store
            .set("seatingPlan", json!({ "tables": {}, "lastUpdated": WriteTimestamp::sentinel() }))
            .await
            .unwrap();

        let value = store.get("seatingPlan").await.unwrap().unwrap();
        assert_eq!(value["lastUpdated"], json!(written_at));
    }

    #[tokio::test]
    async fn test_write_timestamps_increase() {
        let store = MemoryStore::new();
        let first = store.set("a", json!(1)).await.unwrap();
        let second = store.set("a", json!(2)).await.unwrap();
        assert!(second > first);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_own_and_nested_writes() {
        let store = MemoryStore::new();
        let mut plan = store.subscribe("seatingPlan").unwrap();
        let mut presence = store.subscribe("presence").unwrap();

        assert_eq!(plan.next().await, Some(None));
        assert_eq!(presence.next().await, Some(None));

        store.set("seatingPlan", json!({ "tables": { "t1": {} } })).await.unwrap();
        store
            .set("presence/user_1", json!({ "online": true }))
            .await
            .unwrap();

        let snapshot = plan.next().await.unwrap().unwrap();
        assert!(snapshot["tables"].get("t1").is_some());

        let snapshot = presence.next().await.unwrap().unwrap();
        assert_eq!(snapshot["user_1"]["online"], json!(true));
    }

    #[tokio::test]
    async fn test_update_with_nulls_removes_children() {
        let store = MemoryStore::new();
        store.set("presence/a", json!({ "online": true })).await.unwrap();
        store.set("presence/b", json!({ "online": true })).await.unwrap();
        store.set("presence/c", json!({ "online": true })).await.unwrap();

        let mut removals = Map::new();
        removals.insert("a".into(), Value::Null);
        removals.insert("b".into(), Value::Null);
        store.update("presence", removals).await.unwrap();

        let presence = store.get("presence").await.unwrap().unwrap();
        let keys: Vec<&String> = presence.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["c"]);
    }

    #[tokio::test]
    async fn test_remove_notifies_with_none() {
        let store = MemoryStore::new();
        store.set("seatingPlan", json!({ "tables": {} })).await.unwrap();
        let mut sub = store.subscribe("seatingPlan").unwrap();
        assert!(sub.next().await.unwrap().is_some());

        store.remove("seatingPlan").await.unwrap();
        assert_eq!(sub.next().await, Some(None));
        assert!(store.get("seatingPlan").await.unwrap().is_none());
    }
}
