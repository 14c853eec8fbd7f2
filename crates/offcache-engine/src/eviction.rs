//! Count-bounded eviction of the opportunistic partitions.

use std::sync::Arc;
use std::time::Duration;

use offcache_common::Result;
use offcache_store::PartitionStore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSender};

/// A partition and the number of entries it may hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionTarget {
    pub partition: String,
    pub max_items: usize,
}

/// Keeps partitions within their item limits by removing the oldest
/// entries first.
pub struct EvictionManager {
    store: Arc<dyn PartitionStore>,
    targets: Vec<EvictionTarget>,
    events: EventSender,
}

impl EvictionManager {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        targets: Vec<EvictionTarget>,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            targets,
            events,
        }
    }

    pub fn targets(&self) -> &[EvictionTarget] {
        &self.targets
    }

    /// Delete the oldest entries of `partition` until at most `max_items`
    /// remain. Returns how many were removed; a failed deletion is skipped.
    pub async fn trim(&self, partition: &str, max_items: usize) -> Result<usize> {
        let handle = self.store.open(partition).await?;
        let keys = self.store.list_keys(&handle).await?;
        if keys.len() <= max_items {
            return Ok(0);
        }

        let excess = keys.len() - max_items;
        let mut removed = 0;
        for key in keys.iter().take(excess) {
            match self.store.delete(&handle, key).await {
                Ok(true) => removed += 1,
                Ok(false) => debug!(partition, key = %key, "Entry already gone"),
                Err(e) => warn!(partition, key = %key, error = %e, "Failed to evict entry"),
            }
        }

        debug!(partition, removed, max_items, "Trimmed partition");
        Ok(removed)
    }

    /// Trim every target. Emits [`EngineEvent::CacheEvicted`] for each
    /// partition that lost entries. Returns the total removed.
    pub async fn sweep(&self) -> usize {
        let mut total = 0;
        for target in &self.targets {
            match self.trim(&target.partition, target.max_items).await {
                Ok(0) => {}
                Ok(count) => {
                    info!(partition = %target.partition, count, "Evicted cache entries");
                    self.events.emit(EngineEvent::CacheEvicted {
                        partition: target.partition.clone(),
                        count,
                    });
                    total += count;
                }
                Err(e) => warn!(partition = %target.partition, error = %e, "Eviction sweep failed"),
            }
        }
        total
    }

    /// Run [`sweep`](Self::sweep) every `period` until the task is aborted.
    /// The first sweep happens one period after spawning.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
