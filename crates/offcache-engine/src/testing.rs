//! Scripted fakes shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use offcache_common::{OfflineError, Result};
use offcache_net::{Fetcher, Request, Response};
use offcache_store::{
    CacheEntry, CacheKey, MemoryPartitionStore, PartitionHandle, PartitionStore, PendingSyncItem,
};
use tokio::sync::Notify;

use crate::sync_queue::SyncDelivery;

/// One scripted network answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond(u16, String),
    /// Transport failure.
    Fail,
    /// Never completes.
    Hang,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::Respond(200, body.to_string())
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Respond(status, body.to_string())
    }
}

/// Fetcher answering from per-path scripts. Replies are consumed in order
/// and the last one repeats. Unscripted paths fail like an unreachable
/// network.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Request>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, path: &str, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Fail),
            None => Reply::Fail,
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.calls.lock().unwrap().push(request.clone());
        match self.next_reply(request.url.path()) {
            Reply::Respond(status, body) => Ok(Response::new(
                StatusCode::from_u16(status).unwrap(),
                body,
            )),
            Reply::Fail => Err(OfflineError::transport(format!(
                "unreachable: {}",
                request.url
            ))),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Memory store whose reads, writes and deletes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryPartitionStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    failing_key: Mutex<Option<CacheKey>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Fail deletes of one key only.
    pub fn fail_delete_of(&self, key: CacheKey) {
        *self.failing_key.lock().unwrap() = Some(key);
    }

    pub fn inner(&self) -> &MemoryPartitionStore {
        &self.inner
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(OfflineError::storage(format!("{op} failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PartitionStore for FlakyStore {
    async fn open(&self, name: &str) -> Result<PartitionHandle> {
        self.inner.open(name).await
    }

    async fn get(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Self::check(&self.fail_reads, "read")?;
        self.inner.get(handle, key).await
    }

    async fn put(&self, handle: &PartitionHandle, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.put(handle, key, entry).await
    }

    async fn delete(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<bool> {
        Self::check(&self.fail_deletes, "delete")?;
        if self.failing_key.lock().unwrap().as_ref() == Some(key) {
            return Err(OfflineError::storage(format!("delete of {key} failed")));
        }
        self.inner.delete(handle, key).await
    }

    async fn list_keys(&self, handle: &PartitionHandle) -> Result<Vec<CacheKey>> {
        self.inner.list_keys(handle).await
    }

    async fn delete_store(&self, name: &str) -> Result<bool> {
        self.inner.delete_store(name).await
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        self.inner.store_names().await
    }
}

/// Delivery that fails for payloads whose `"name"` is in the failing set.
/// With a gate, every delivery waits for one permit first.
#[derive(Default)]
pub struct ScriptedDelivery {
    failing: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    attempts: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().push(name.to_string());
    }

    pub fn recover(&self, name: &str) {
        self.failing.lock().unwrap().retain(|n| n != name);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

pub fn name_of(item: &PendingSyncItem) -> String {
    item.payload["name"].as_str().unwrap_or_default().to_string()
}

#[async_trait]
impl SyncDelivery for ScriptedDelivery {
    async fn deliver(&self, item: &PendingSyncItem) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let name = name_of(item);
        self.attempts.lock().unwrap().push(name.clone());
        if self.failing.lock().unwrap().contains(&name) {
            return Err(OfflineError::transport(format!("cannot deliver {name}")));
        }
        self.delivered.lock().unwrap().push(name);
        Ok(())
    }
}
