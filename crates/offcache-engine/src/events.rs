//! Typed notifications the engine emits for the host to relay to its UI.

use offcache_store::SyncItemId;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::lifecycle::LifecycleState;

/// Engine events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A queued item was delivered and removed.
    SyncItemSucceeded { id: SyncItemId },
    /// A queued item failed again and stays queued.
    SyncItemFailed { id: SyncItemId, attempts: u32 },
    /// A drain finished with nothing left in the queue.
    SyncDrainEmpty,
    /// Old entries were trimmed from a partition.
    CacheEvicted { partition: String, count: usize },
    /// The lifecycle controller changed state.
    LifecycleChanged { state: LifecycleState },
}

/// Receiving half handed to the host.
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Sending half shared by the engine's components.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSender {
    /// Emit an event. A host that dropped its receiver simply stops hearing.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Create an event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
