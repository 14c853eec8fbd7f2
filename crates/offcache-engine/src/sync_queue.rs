//! Durable queue of mutating actions taken while offline.
//!
//! Items are delivered at least once: an item leaves the log only after its
//! delivery succeeded, so a crash between delivery and removal replays it.
//! At most one drain runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use offcache_common::Result;
use offcache_store::{PendingSyncItem, QueueLog, SyncItemId};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSender};

/// Delivers one queued item. An error keeps the item queued.
#[async_trait]
pub trait SyncDelivery: Send + Sync {
    async fn deliver(&self, item: &PendingSyncItem) -> Result<()>;
}

/// Result of one completed drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Delivered and removed, in delivery order.
    pub synced: Vec<SyncItemId>,
    /// Still queued after this pass.
    pub failed: Vec<SyncItemId>,
    /// Items left in the log after the pass.
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain held the queue; nothing was attempted.
    AlreadyRunning,
}

pub struct SyncQueue {
    log: Arc<dyn QueueLog>,
    delivery: Arc<dyn SyncDelivery>,
    events: EventSender,
    draining: AtomicBool,
}

/// Clears the busy flag when a drain ends, including by panic or
/// cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncQueue {
    pub fn new(log: Arc<dyn QueueLog>, delivery: Arc<dyn SyncDelivery>, events: EventSender) -> Self {
        Self {
            log,
            delivery,
            events,
            draining: AtomicBool::new(false),
        }
    }

    /// Append a payload. It is durable once this returns.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<SyncItemId> {
        let item = self.log.append(payload).await?;
        debug!(id = %item.id, "Queued sync item");
        Ok(item.id)
    }

    /// Queued items, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingSyncItem>> {
        self.log.items().await
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Try to deliver every queued item once, oldest first.
    ///
    /// Events for the pass are emitted after it completes, followed by
    /// [`EngineEvent::SyncDrainEmpty`] if the pass emptied the queue. A
    /// drain of an already empty queue emits nothing.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already running");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.draining);

        let items = self.log.items().await?;
        let mut report = DrainReport::default();
        let mut events = Vec::with_capacity(items.len());

        for item in &items {
            match self.delivery.deliver(item).await {
                Ok(()) => match self.log.remove(item.id).await {
                    Ok(_) => {
                        report.synced.push(item.id);
                        events.push(EngineEvent::SyncItemSucceeded { id: item.id });
                    }
                    Err(e) => {
                        warn!(id = %item.id, error = %e, "Delivered item could not be removed");
                        report.failed.push(item.id);
                        events.push(EngineEvent::SyncItemFailed {
                            id: item.id,
                            attempts: item.attempts,
                        });
                    }
                },
                Err(delivery_error) => {
                    let attempts = match self.log.record_failure(item.id).await {
                        Ok(attempts) => attempts,
                        Err(e) => {
                            warn!(id = %item.id, error = %e, "Failed to record delivery failure");
                            item.attempts + 1
                        }
                    };
                    debug!(id = %item.id, attempts, error = %delivery_error, "Sync item failed");
                    report.failed.push(item.id);
                    events.push(EngineEvent::SyncItemFailed { id: item.id, attempts });
                }
            }
        }

        report.remaining = match self.log.len().await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "Failed to count remaining sync items");
                report.failed.len()
            }
        };

        for event in events {
            self.events.emit(event);
        }
        if !items.is_empty() && report.remaining == 0 {
            self.events.emit(EngineEvent::SyncDrainEmpty);
        }

        if !items.is_empty() {
            info!(
                synced = report.synced.len(),
                failed = report.failed.len(),
                remaining = report.remaining,
                "Drain complete"
            );
        }
        Ok(DrainOutcome::Completed(report))
    }

    /// Drain every time `online` changes to `true`. The task ends when the
    /// sender is dropped.
    pub fn spawn_reconnect_listener(
        self: Arc<Self>,
        mut online: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut was_online = *online.borrow_and_update();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let now_online = *online.borrow_and_update();
                if now_online && !was_online {
                    info!("Connectivity restored, draining sync queue");
                    if let Err(e) = self.drain().await {
                        warn!(error = %e, "Drain after reconnect failed");
                    }
                }
                was_online = now_online;
            }
            debug!("Reconnect signal closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{channel, EventReceiver};
    use crate::testing::{name_of, ScriptedDelivery};
    use offcache_store::{MemoryQueueLog, SqliteStore};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn queue(delivery: Arc<ScriptedDelivery>) -> (Arc<SyncQueue>, Arc<MemoryQueueLog>, EventReceiver) {
        let log = Arc::new(MemoryQueueLog::new());
        let (tx, rx) = channel();
        (Arc::new(SyncQueue::new(log.clone(), delivery, tx)), log, rx)
    }

    fn events(rx: &mut EventReceiver) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn completed(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            DrainOutcome::AlreadyRunning => panic!("drain did not run"),
        }
    }

    #[tokio::test]
    async fn test_drain_keeps_failures_and_reports_events() {
        let delivery = Arc::new(ScriptedDelivery::new());
        delivery.fail("B");
        let (queue, _log, mut rx) = queue(delivery.clone());
        let a = queue.enqueue(json!({ "name": "A" })).await.unwrap();
        let b = queue.enqueue(json!({ "name": "B" })).await.unwrap();

        let report = completed(queue.drain().await.unwrap());
        assert_eq!(
            report,
            DrainReport {
                synced: vec![a],
                failed: vec![b],
                remaining: 1
            }
        );

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
        assert_eq!(name_of(&pending[0]), "B");
        assert_eq!(pending[0].attempts, 1);

        assert_eq!(
            events(&mut rx),
            vec![
                EngineEvent::SyncItemSucceeded { id: a },
                EngineEvent::SyncItemFailed { id: b, attempts: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_empty_event_after_full_success() {
        let delivery = Arc::new(ScriptedDelivery::new());
        let (queue, _log, mut rx) = queue(delivery.clone());
        let a = queue.enqueue(json!({ "name": "A" })).await.unwrap();

        completed(queue.drain().await.unwrap());
        assert_eq!(
            events(&mut rx),
            vec![
                EngineEvent::SyncItemSucceeded { id: a },
                EngineEvent::SyncDrainEmpty,
            ]
        );
    }

    #[tokio::test]
    async fn test_items_delivered_at_least_once() {
        let delivery = Arc::new(ScriptedDelivery::new());
        delivery.fail("A");
        let (queue, _log, _rx) = queue(delivery.clone());
        queue.enqueue(json!({ "name": "A" })).await.unwrap();
        queue.enqueue(json!({ "name": "B" })).await.unwrap();

        completed(queue.drain().await.unwrap());
        completed(queue.drain().await.unwrap());
        assert_eq!(queue.pending().await.unwrap()[0].attempts, 2);

        delivery.recover("A");
        let report = completed(queue.drain().await.unwrap());
        assert_eq!(report.remaining, 0);
        assert_eq!(delivery.delivered(), vec!["B", "A"]);
        assert_eq!(delivery.attempts(), vec!["A", "B", "A", "A"]);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_rejected() {
        let gate = Arc::new(Notify::new());
        let delivery = Arc::new(ScriptedDelivery::gated(gate.clone()));
        let (queue, _log, _rx) = queue(delivery.clone());
        queue.enqueue(json!({ "name": "A" })).await.unwrap();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        while !queue.is_draining() {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.drain().await.unwrap(), DrainOutcome::AlreadyRunning);
        assert!(delivery.attempts().is_empty());

        gate.notify_one();
        let report = completed(first.await.unwrap().unwrap());
        assert_eq!(report.synced.len(), 1);
        assert!(!queue.is_draining());
        assert_eq!(delivery.attempts(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_items_enqueued_during_drain_wait_for_next_pass() {
        let gate = Arc::new(Notify::new());
        let delivery = Arc::new(ScriptedDelivery::gated(gate.clone()));
        let (queue, _log, mut rx) = queue(delivery.clone());
        let a = queue.enqueue(json!({ "name": "A" })).await.unwrap();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        while !queue.is_draining() {
            tokio::task::yield_now().await;
        }
        let b = queue.enqueue(json!({ "name": "B" })).await.unwrap();

        gate.notify_one();
        let report = completed(first.await.unwrap().unwrap());
        assert_eq!(
            report,
            DrainReport {
                synced: vec![a],
                failed: vec![],
                remaining: 1
            }
        );
        assert_eq!(delivery.attempts(), vec!["A"]);
        assert_eq!(queue.pending().await.unwrap()[0].id, b);
        assert_eq!(events(&mut rx), vec![EngineEvent::SyncItemSucceeded { id: a }]);
    }

    #[tokio::test]
    async fn test_draining_empty_queue_is_silent() {
        let delivery = Arc::new(ScriptedDelivery::new());
        let (queue, _log, mut rx) = queue(delivery.clone());

        let report = completed(queue.drain().await.unwrap());
        assert_eq!(report, DrainReport::default());
        assert!(events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let delivery = Arc::new(ScriptedDelivery::new());
        let (queue, _log, mut rx) = queue(delivery.clone());
        let a = queue.enqueue(json!({ "name": "A" })).await.unwrap();

        let (online_tx, online_rx) = watch::channel(false);
        let listener = queue.clone().spawn_reconnect_listener(online_rx);
        online_tx.send(true).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, EngineEvent::SyncItemSucceeded { id: a });

        drop(online_tx);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");

        let id = {
            let log = Arc::new(SqliteStore::new(&path).unwrap());
            let (tx, _rx) = channel();
            let queue = SyncQueue::new(log, Arc::new(ScriptedDelivery::new()), tx);
            queue.enqueue(json!({ "name": "A" })).await.unwrap()
        };

        let log = Arc::new(SqliteStore::new(&path).unwrap());
        let delivery = Arc::new(ScriptedDelivery::new());
        let (tx, mut rx) = channel();
        let queue = SyncQueue::new(log, delivery.clone(), tx);

        assert_eq!(queue.pending().await.unwrap()[0].id, id);
        completed(queue.drain().await.unwrap());
        assert_eq!(delivery.delivered(), vec!["A"]);
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::SyncItemSucceeded { id });
    }
}
