//! In-memory stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use offcache_common::{OptionExt, Result};
use tokio::sync::RwLock;
use tracing::trace;

use crate::{
    now_millis, CacheEntry, CacheKey, PartitionHandle, PartitionStore, PendingSyncItem, QueueLog,
    SyncItemId,
};

// ==================== Partitions ====================

#[derive(Debug, Default)]
struct Partition {
    entries: HashMap<CacheKey, CacheEntry>,
    /// inserted_at → key
    order: BTreeMap<u64, CacheKey>,
}

impl Partition {
    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.inserted_at);
        }
        self.order.insert(entry.inserted_at, key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.order.remove(&old.inserted_at);
                true
            }
            None => false,
        }
    }
}

/// Partition store kept in process memory.
#[derive(Debug)]
pub struct MemoryPartitionStore {
    partitions: RwLock<HashMap<String, Partition>>,
    next_seq: AtomicU64,
}

impl MemoryPartitionStore {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Number of entries in a partition, zero when it does not exist.
    pub async fn len(&self, name: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(name)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryPartitionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartitionStore for MemoryPartitionStore {
    async fn open(&self, name: &str) -> Result<PartitionHandle> {
        self.partitions
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(PartitionHandle::new(name))
    }

    async fn get(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(handle.name())
            .and_then(|p| p.entries.get(key))
            .cloned())
    }

    async fn put(
        &self,
        handle: &PartitionHandle,
        key: &CacheKey,
        mut entry: CacheEntry,
    ) -> Result<()> {
        entry.inserted_at = self.next_seq.fetch_add(1, Ordering::Relaxed);
        trace!(partition = handle.name(), key = %key, seq = entry.inserted_at, "put");
        self.partitions
            .write()
            .await
            .entry(handle.name().to_string())
            .or_default()
            .insert(key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<bool> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .get_mut(handle.name())
            .map(|p| p.remove(key))
            .unwrap_or(false))
    }

    async fn list_keys(&self, handle: &PartitionHandle) -> Result<Vec<CacheKey>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(handle.name())
            .map(|p| p.order.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_store(&self, name: &str) -> Result<bool> {
        Ok(self.partitions.write().await.remove(name).is_some())
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.partitions.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// ==================== Sync Log ====================

/// Sync log kept in process memory.
#[derive(Debug)]
pub struct MemoryQueueLog {
    items: RwLock<Vec<PendingSyncItem>>,
    next_id: AtomicU64,
}

impl MemoryQueueLog {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryQueueLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueLog for MemoryQueueLog {
    async fn append(&self, payload: serde_json::Value) -> Result<PendingSyncItem> {
        let item = PendingSyncItem {
            id: SyncItemId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            payload,
            created_at: now_millis(),
            attempts: 0,
            last_attempt_at: None,
        };
        self.items.write().await.push(item.clone());
        Ok(item)
    }

    async fn items(&self) -> Result<Vec<PendingSyncItem>> {
        Ok(self.items.read().await.clone())
    }

    async fn remove(&self, id: SyncItemId) -> Result<bool> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| item.id != id);
        Ok(items.len() != before)
    }

    async fn record_failure(&self, id: SyncItemId) -> Result<u32> {
        let mut items = self.items.write().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_not_found(format!("sync item {id}"))?;
        item.attempts += 1;
        item.last_attempt_at = Some(now_millis());
        Ok(item.attempts)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offcache_common::OfflineError;
    use url::Url;

    fn key(n: usize) -> CacheKey {
        CacheKey::get(&Url::parse(&format!("https://example.com/k{n}")).unwrap())
    }

    fn entry(body: &str) -> CacheEntry {
        CacheEntry::new(200, vec![], body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryPartitionStore::new();
        let handle = store.open("static-v1").await.unwrap();

        store.put(&handle, &key(1), entry("one")).await.unwrap();
        let found = store.get(&handle, &key(1)).await.unwrap().unwrap();
        assert_eq!(found.body, b"one");
        assert!(found.inserted_at > 0);

        assert!(store.delete(&handle, &key(1)).await.unwrap());
        assert!(!store.delete(&handle, &key(1)).await.unwrap());
        assert!(store.get(&handle, &key(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_keys_in_insertion_order() {
        let store = MemoryPartitionStore::new();
        let handle = store.open("dynamic-v1").await.unwrap();

        for n in [3, 1, 2] {
            store.put(&handle, &key(n), entry("x")).await.unwrap();
        }

        assert_eq!(
            store.list_keys(&handle).await.unwrap(),
            vec![key(3), key(1), key(2)]
        );
    }

    #[tokio::test]
    async fn test_overwrite_moves_key_to_newest() {
        let store = MemoryPartitionStore::new();
        let handle = store.open("dynamic-v1").await.unwrap();

        store.put(&handle, &key(1), entry("old")).await.unwrap();
        store.put(&handle, &key(2), entry("x")).await.unwrap();
        store.put(&handle, &key(1), entry("new")).await.unwrap();

        assert_eq!(store.list_keys(&handle).await.unwrap(), vec![key(2), key(1)]);
        let found = store.get(&handle, &key(1)).await.unwrap().unwrap();
        assert_eq!(found.body, b"new");
        assert_eq!(store.len("dynamic-v1").await, 2);
    }

    #[tokio::test]
    async fn test_delete_store_and_names() {
        let store = MemoryPartitionStore::new();
        store.open("static-v1").await.unwrap();
        store.open("api-v1").await.unwrap();

        assert_eq!(
            store.store_names().await.unwrap(),
            vec!["api-v1".to_string(), "static-v1".to_string()]
        );
        assert!(store.delete_store("api-v1").await.unwrap());
        assert!(!store.delete_store("api-v1").await.unwrap());
        assert_eq!(store.store_names().await.unwrap(), vec!["static-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_log_order_and_attempts() {
        let log = MemoryQueueLog::new();
        let a = log.append(serde_json::json!({ "n": "a" })).await.unwrap();
        let b = log.append(serde_json::json!({ "n": "b" })).await.unwrap();
        assert!(a.id < b.id);
        assert_eq!(a.attempts, 0);

        assert_eq!(log.record_failure(b.id).await.unwrap(), 1);
        assert_eq!(log.record_failure(b.id).await.unwrap(), 2);
        assert!(log.remove(a.id).await.unwrap());

        let items = log.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, b.id);
        assert_eq!(items[0].attempts, 2);
        assert!(items[0].last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_record_failure_unknown_item() {
        let log = MemoryQueueLog::new();
        let err = log.record_failure(SyncItemId(99)).await.unwrap_err();
        assert!(matches!(err, OfflineError::NotFound(_)));
    }
}
