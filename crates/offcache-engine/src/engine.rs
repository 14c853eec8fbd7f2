//! The engine facade the host talks to.

use std::sync::Arc;

use offcache_common::{OfflineError, Result};
use offcache_net::{Fetcher, Request, Response};
use offcache_store::{PartitionStore, PendingSyncItem, QueueLog, SyncItemId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::classify::{Category, Classifier, Route};
use crate::config::{EngineConfig, PartitionKind};
use crate::eviction::{EvictionManager, EvictionTarget};
use crate::events::{self, EventReceiver};
use crate::lifecycle::{LifecycleController, LifecyclePlan, LifecycleState};
use crate::mutation::{FetchDelivery, MutationRecord};
use crate::strategy::{NavigationFallback, Strategy, StrategyExecutor};
use crate::sync_queue::{DrainOutcome, SyncDelivery, SyncQueue};

/// Result of offering a request to the engine.
#[derive(Debug)]
pub enum Interception {
    /// Not handled; the host performs the request itself.
    PassThrough,
    Respond(Response),
}

/// Result of [`OfflineEngine::send_mutation`].
#[derive(Debug)]
pub enum MutationOutcome {
    /// The network answered.
    Delivered(Response),
    /// The network was unreachable or failed; the request is queued.
    Queued(SyncItemId),
}

/// Offline caching engine.
pub struct OfflineEngine {
    config: EngineConfig,
    classifier: Classifier,
    executor: StrategyExecutor,
    fallback: NavigationFallback,
    lifecycle: LifecycleController,
    eviction: Arc<EvictionManager>,
    sync: Arc<SyncQueue>,
    fetcher: Arc<dyn Fetcher>,
}

impl OfflineEngine {
    /// Create an engine that replays queued mutations through `fetcher`.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PartitionStore>,
        log: Arc<dyn QueueLog>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, EventReceiver)> {
        let delivery = Arc::new(FetchDelivery::new(Arc::clone(&fetcher)));
        Self::with_delivery(config, store, log, fetcher, delivery)
    }

    /// Create an engine with a custom delivery for queued items.
    pub fn with_delivery(
        config: EngineConfig,
        store: Arc<dyn PartitionStore>,
        log: Arc<dyn QueueLog>,
        fetcher: Arc<dyn Fetcher>,
        delivery: Arc<dyn SyncDelivery>,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let (sender, rx) = events::channel();

        let fallback = NavigationFallback {
            partition: config.partition_name(PartitionKind::Static),
            offline_document: config.lifecycle.resolve(&config.lifecycle.offline_fallback)?,
            shell_root: config.lifecycle.resolve(&config.lifecycle.shell_root)?,
        };

        let plan = LifecyclePlan {
            app_shell: config.lifecycle.app_shell_urls()?,
            static_partition: config.partition_name(PartitionKind::Static),
            current_partitions: config.partitions.current_names(),
        };

        let targets = config
            .eviction
            .limits
            .iter()
            .map(|(kind, max_items)| EvictionTarget {
                partition: config.partition_name(*kind),
                max_items: *max_items,
            })
            .collect();

        let engine = Self {
            classifier: Classifier::new(&config.classifier),
            executor: StrategyExecutor::new(Arc::clone(&store), Arc::clone(&fetcher)),
            fallback,
            lifecycle: LifecycleController::new(
                Arc::clone(&store),
                Arc::clone(&fetcher),
                plan,
                sender.clone(),
            ),
            eviction: Arc::new(EvictionManager::new(store, targets, sender.clone())),
            sync: Arc::new(SyncQueue::new(log, delivery, sender)),
            fetcher,
            config,
        };
        info!(version = %engine.config.partitions.version, "Offline engine created");
        Ok((engine, rx))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.sync
    }

    pub fn eviction(&self) -> &Arc<EvictionManager> {
        &self.eviction
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.state().await
    }

    /// The strategy serving a category.
    pub fn strategy_for(category: Category) -> Strategy {
        match category {
            Category::StaticAsset => Strategy::CacheFirst,
            Category::ApiCall => Strategy::NetworkFirst,
            Category::Navigation => Strategy::NavigationFallback,
            Category::Other => Strategy::StaleWhileRevalidate,
        }
    }

    /// Offer an intercepted request. Non-GET requests pass through.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Interception> {
        let classified = match self.classifier.route(request) {
            Route::Bypass => {
                trace!(method = %request.method, url = %request.url, "Passing through");
                return Ok(Interception::PassThrough);
            }
            Route::Intercept(classified) => classified,
        };

        let strategy = Self::strategy_for(classified.category);
        debug!(url = %request.url, category = ?classified.category, ?strategy, "Handling fetch");

        let response = match strategy {
            Strategy::CacheFirst => {
                self.executor
                    .cache_first(request, &self.partition(PartitionKind::Static))
                    .await
            }
            Strategy::NetworkFirst => {
                self.executor
                    .network_first(request, &self.partition(PartitionKind::Api))
                    .await
            }
            Strategy::NavigationFallback => {
                self.executor
                    .navigation_with_fallback(request, &self.fallback)
                    .await?
            }
            Strategy::StaleWhileRevalidate => {
                self.executor
                    .stale_while_revalidate(request, &self.partition(PartitionKind::Dynamic))
                    .await?
            }
        };
        Ok(Interception::Respond(response))
    }

    /// Send a mutating request, queueing it for background delivery when
    /// the network is unreachable or answers with a server error.
    pub async fn send_mutation(&self, request: Request) -> Result<MutationOutcome> {
        match self.fetcher.fetch(&request).await {
            Ok(response) if !response.status.is_server_error() => {
                Ok(MutationOutcome::Delivered(response))
            }
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Server error, queueing mutation");
                self.queue_mutation(&request).await
            }
            Err(e) if e.is_transport() => {
                debug!(url = %request.url, error = %e, "Offline, queueing mutation");
                self.queue_mutation(&request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn queue_mutation(&self, request: &Request) -> Result<MutationOutcome> {
        let payload = MutationRecord::from_request(request).to_payload()?;
        let id = self.sync.enqueue(payload).await?;
        Ok(MutationOutcome::Queued(id))
    }

    /// Cache the app shell, retrying per the configured policy.
    pub async fn install(&self) -> Result<usize> {
        self.lifecycle
            .install_with_retry(&self.config.sync.install_retry())
            .await
    }

    /// Remove outdated partitions and claim clients.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.lifecycle.activate().await
    }

    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<SyncItemId> {
        self.sync.enqueue(payload).await
    }

    pub async fn pending(&self) -> Result<Vec<PendingSyncItem>> {
        self.sync.pending().await
    }

    pub async fn drain(&self) -> Result<DrainOutcome> {
        self.sync.drain().await
    }

    /// Trim every bounded partition now. Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        self.eviction.sweep().await
    }

    /// Start the periodic eviction sweep at the configured period.
    pub fn spawn_eviction(&self) -> JoinHandle<()> {
        Arc::clone(&self.eviction).spawn_periodic(self.config.eviction.period())
    }

    /// Drain the sync queue whenever `online` flips to `true`.
    pub fn spawn_reconnect_listener(&self, online: watch::Receiver<bool>) -> JoinHandle<()> {
        Arc::clone(&self.sync).spawn_reconnect_listener(online)
    }

    fn partition(&self, kind: PartitionKind) -> String {
        self.config.partition_name(kind)
    }
}

impl Interception {
    /// The response, or an error if the request was passed through.
    pub fn into_response(self) -> Result<Response> {
        match self {
            Interception::Respond(response) => Ok(response),
            Interception::PassThrough => Err(OfflineError::NotFound(
                "request was passed through".to_string(),
            )),
        }
    }
}
