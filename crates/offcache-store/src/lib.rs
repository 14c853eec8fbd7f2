//! # Offcache Store
//!
//! The two durable stores the caching engine is allowed to own.
//!
//! ## Features
//!
//! - **PartitionStore**: named key → response blob stores with insertion order
//! - **QueueLog**: an ordered log of pending sync items
//! - **MemoryStore**: in-process implementations for tests and ephemeral hosts
//! - **SqliteStore**: a single-file implementation of both that survives restarts
//!
//! ## Architecture
//!
//! ```text
//! PartitionStore
//!     │
//!     └── partition ("static-v1", "dynamic-v1", ...)
//!             └── CacheKey → CacheEntry   (ordered by inserted_at)
//!
//! QueueLog
//!     └── PendingSyncItem (ordered by id, oldest first)
//! ```

use async_trait::async_trait;
use offcache_common::Result;
use serde::{Deserialize, Serialize};
use url::Url;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryPartitionStore, MemoryQueueLog};
pub use sqlite::SqliteStore;

// ==================== Cache Types ====================

/// Canonical identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key for a request.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.to_ascii_uppercase(), url))
    }

    /// Build a key for a GET request.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }

    /// Rebuild a key from its stored form.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL part of the key.
    pub fn url(&self) -> &str {
        self.0.split_once(' ').map(|(_, url)| url).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response status.
    pub status: u16,

    /// Response headers, in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Logical insertion order, assigned by the store on put.
    pub inserted_at: u64,
}

impl CacheEntry {
    /// Create an entry. The store assigns `inserted_at`.
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            inserted_at: 0,
        }
    }
}

/// Handle to an opened partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionHandle {
    name: String,
}

impl PartitionHandle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Storage name of the partition.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Key → response blob store with named partitions.
///
/// A put for an existing key replaces the entry and moves it to the newest
/// position of the partition's key order.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Open a partition, creating it when missing.
    async fn open(&self, name: &str) -> Result<PartitionHandle>;

    /// Look up an entry.
    async fn get(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry.
    async fn put(&self, handle: &PartitionHandle, key: &CacheKey, entry: CacheEntry)
        -> Result<()>;

    /// Delete an entry. Returns whether it existed.
    async fn delete(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<bool>;

    /// All keys, oldest insertion first.
    async fn list_keys(&self, handle: &PartitionHandle) -> Result<Vec<CacheKey>>;

    /// Delete a whole partition. Returns whether it existed.
    async fn delete_store(&self, name: &str) -> Result<bool>;

    /// Names of every existing partition, sorted.
    async fn store_names(&self) -> Result<Vec<String>>;
}

// ==================== Sync Types ====================

/// Identifier of a pending sync item. Monotonic per log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncItemId(pub u64);

impl std::fmt::Display for SyncItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A queued mutating action waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSyncItem {
    pub id: SyncItemId,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Milliseconds since the Unix epoch of the last failed attempt.
    pub last_attempt_at: Option<i64>,
}

/// Ordered, durable log of pending sync items.
#[async_trait]
pub trait QueueLog: Send + Sync {
    /// Append a payload with zero attempts. Durable before returning.
    async fn append(&self, payload: serde_json::Value) -> Result<PendingSyncItem>;

    /// All items, oldest first.
    async fn items(&self) -> Result<Vec<PendingSyncItem>>;

    /// Remove a delivered item. Returns whether it existed.
    async fn remove(&self, id: SyncItemId) -> Result<bool>;

    /// Count a failed attempt and return the new attempt count.
    async fn record_failure(&self, id: SyncItemId) -> Result<u32>;

    /// Number of queued items.
    async fn len(&self) -> Result<usize>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_drops_fragment() {
        let a = CacheKey::get(&Url::parse("https://example.com/app.js#v2").unwrap());
        let b = CacheKey::get(&Url::parse("https://example.com/app.js").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "GET https://example.com/app.js");
        assert_eq!(a.url(), "https://example.com/app.js");
    }

    #[test]
    fn test_cache_key_keeps_query() {
        let a = CacheKey::get(&Url::parse("https://example.com/api?page=1").unwrap());
        let b = CacheKey::get(&Url::parse("https://example.com/api?page=2").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_method_case() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(CacheKey::new("get", &url), CacheKey::get(&url));
    }
}
