//! Install and activation.
//!
//! Install pre-caches the app shell all-or-nothing. Activation removes
//! partitions left behind by earlier versions and takes control of every
//! client at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use offcache_common::{retry_with_backoff, OfflineError, Result, RetryConfig};
use offcache_net::{Fetcher, Request, Response};
use offcache_store::{CacheKey, PartitionStore};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::events::{EngineEvent, EventSender};
use crate::strategy::snapshot;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Nothing installed yet.
    #[default]
    Idle,
    /// Fetching the app shell.
    Installing,
    /// App shell cached, waiting for activation.
    Installed,
    /// Removing old partitions.
    Activating,
    /// In control of all clients.
    Active,
    /// The last install did not complete.
    Failed,
}

/// What the controller installs and keeps.
#[derive(Debug, Clone)]
pub struct LifecyclePlan {
    /// App shell URLs, all required.
    pub app_shell: Vec<Url>,
    /// Partition the app shell is stored in.
    pub static_partition: String,
    /// Partitions that survive activation.
    pub current_partitions: Vec<String>,
}

pub struct LifecycleController {
    store: Arc<dyn PartitionStore>,
    fetcher: Arc<dyn Fetcher>,
    plan: LifecyclePlan,
    events: EventSender,
    state: RwLock<LifecycleState>,
    clients_claimed: AtomicBool,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        fetcher: Arc<dyn Fetcher>,
        plan: LifecyclePlan,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            fetcher,
            plan,
            events,
            state: RwLock::new(LifecycleState::Idle),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Whether activation has taken control of all clients.
    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    /// Cache the whole app shell. Returns the number of entries stored.
    ///
    /// Every resource is fetched before anything is written; a single
    /// failed or non-2xx fetch leaves the store untouched. A failed write
    /// removes the static partition again.
    pub async fn install(&self) -> Result<usize> {
        self.transition(LifecycleState::Installing).await;

        match self.install_shell().await {
            Ok(count) => {
                info!(count, partition = %self.plan.static_partition, "App shell installed");
                self.transition(LifecycleState::Installed).await;
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.transition(LifecycleState::Failed).await;
                Err(e)
            }
        }
    }

    /// [`install`](Self::install) with exponential backoff between attempts.
    pub async fn install_with_retry(&self, retry: &RetryConfig) -> Result<usize> {
        retry_with_backoff(retry, || self.install()).await
    }

    /// Delete every partition not in the current set, then claim all
    /// clients. Returns the deleted partition names.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let previous = self.state().await;
        if !matches!(previous, LifecycleState::Installed | LifecycleState::Active) {
            return Err(OfflineError::precondition(format!(
                "cannot activate from {previous:?}"
            )));
        }
        self.transition(LifecycleState::Activating).await;

        let names = match self.store.store_names().await {
            Ok(names) => names,
            Err(e) => {
                self.transition(previous).await;
                return Err(e);
            }
        };

        let mut deleted = Vec::new();
        for name in names {
            if self.plan.current_partitions.contains(&name) {
                continue;
            }
            match self.store.delete_store(&name).await {
                Ok(true) => {
                    info!(partition = %name, "Deleted outdated partition");
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => warn!(partition = %name, error = %e, "Failed to delete outdated partition"),
            }
        }

        self.clients_claimed.store(true, Ordering::SeqCst);
        self.transition(LifecycleState::Active).await;
        Ok(deleted)
    }

    async fn install_shell(&self) -> Result<usize> {
        let mut fetched: Vec<(CacheKey, Response)> = Vec::with_capacity(self.plan.app_shell.len());
        for url in &self.plan.app_shell {
            let response = self
                .fetcher
                .fetch(&Request::get(url.clone()))
                .await
                .map_err(|e| OfflineError::precondition(format!("failed to fetch {url}: {e}")))?;
            if !response.ok() {
                return Err(OfflineError::precondition(format!(
                    "{url} answered {}",
                    response.status
                )));
            }
            debug!(url = %url, "Fetched app shell resource");
            fetched.push((CacheKey::get(url), response));
        }

        let partition = &self.plan.static_partition;
        if let Err(e) = self.write_all(partition, &fetched).await {
            if let Err(cleanup) = self.store.delete_store(partition).await {
                warn!(partition, error = %cleanup, "Failed to remove partial install");
            }
            return Err(OfflineError::precondition(format!(
                "failed to store app shell: {e}"
            )));
        }
        Ok(fetched.len())
    }

    async fn write_all(&self, partition: &str, fetched: &[(CacheKey, Response)]) -> Result<()> {
        let handle = self.store.open(partition).await?;
        for (key, response) in fetched {
            self.store.put(&handle, key, snapshot(response)).await?;
        }
        Ok(())
    }

    async fn transition(&self, state: LifecycleState) {
        *self.state.write().await = state;
        debug!(?state, "Lifecycle state changed");
        self.events.emit(EngineEvent::LifecycleChanged { state });
    }
}
