//! The four caching strategies.
//!
//! Each strategy is built from two steps, a network step and a cache step.
//! Both produce a [`Resolution`] so the fallback paths are ordinary values
//! instead of error handling.

use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use offcache_common::{OfflineError, Result};
use offcache_net::{Fetcher, Request, Response, ResponseSource};
use offcache_store::{CacheEntry, CacheKey, PartitionStore};
use serde_json::json;
use tracing::{debug, trace, warn};
use url::Url;

/// Body of the synthetic cache-first miss.
pub const OFFLINE_CONTENT_TEXT: &str = "offline content not available";

/// Outcome of one step of a strategy.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A usable response; its `source` says whether network or cache provided it.
    Hit(Response),
    /// Nothing usable.
    Miss,
}

impl Resolution {
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            Resolution::Hit(response) => Some(response.source),
            Resolution::Miss => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Resolution::Hit(response) => Some(response),
            Resolution::Miss => None,
        }
    }
}

/// Which algorithm serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NavigationFallback,
}

/// Documents served when a navigation cannot reach the network.
#[derive(Debug, Clone)]
pub struct NavigationFallback {
    /// Partition holding the documents.
    pub partition: String,
    /// Tried first.
    pub offline_document: Url,
    /// Tried when the offline document is missing.
    pub shell_root: Url,
}

/// Runs strategies against a partition store and the network.
#[derive(Clone)]
pub struct StrategyExecutor {
    store: Arc<dyn PartitionStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl StrategyExecutor {
    pub fn new(store: Arc<dyn PartitionStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Serve from cache; fetch and store only on a miss.
    pub async fn cache_first(&self, request: &Request, partition: &str) -> Response {
        let key = CacheKey::get(&request.url);

        let resolution = match lookup(self.store.as_ref(), partition, &key).await {
            Resolution::Miss => self.network_step(request, partition).await,
            hit => hit,
        };

        resolution.into_response().unwrap_or_else(|| {
            Response::synthetic_text(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_CONTENT_TEXT)
        })
    }

    /// Prefer the network; fall back to cache only when the network is
    /// unreachable. Non-2xx answers are returned as they are.
    pub async fn network_first(&self, request: &Request, partition: &str) -> Response {
        let resolution = match self.network_step(request, partition).await {
            Resolution::Miss => lookup(self.store.as_ref(), partition, &CacheKey::get(&request.url)).await,
            hit => hit,
        };

        resolution.into_response().unwrap_or_else(offline_json)
    }

    /// Return the cached response at once while a background fetch refreshes
    /// the cache for later reads. Without a cached response the fetch is
    /// awaited and its failure propagates.
    pub async fn stale_while_revalidate(
        &self,
        request: &Request,
        partition: &str,
    ) -> Result<Response> {
        let key = CacheKey::get(&request.url);
        let cached = lookup(self.store.as_ref(), partition, &key).await;

        let revalidation = {
            let store = Arc::clone(&self.store);
            let fetcher = Arc::clone(&self.fetcher);
            let request = request.clone();
            let partition = partition.to_string();
            tokio::spawn(async move {
                let response = match fetcher.fetch(&request).await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Revalidation failed");
                        return Err(e);
                    }
                };
                if response.ok() {
                    store_response(store.as_ref(), &partition, &key, &response).await;
                }
                Ok::<_, OfflineError>(response)
            })
        };

        match cached {
            Resolution::Hit(response) => {
                trace!(url = %request.url, "Serving stale entry while revalidating");
                Ok(response)
            }
            Resolution::Miss => revalidation
                .await
                .map_err(|e| OfflineError::internal(format!("revalidation task failed: {e}")))?,
        }
    }

    /// Fetch a navigation; serve a cached fallback document when the network
    /// is unreachable. Successful navigations are not cached here.
    pub async fn navigation_with_fallback(
        &self,
        request: &Request,
        fallback: &NavigationFallback,
    ) -> Result<Response> {
        let error = match self.fetcher.fetch(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        debug!(url = %request.url, error = %error, "Navigation failed, looking for fallback");

        for document in [&fallback.offline_document, &fallback.shell_root] {
            let key = CacheKey::get(document);
            if let Resolution::Hit(response) =
                lookup(self.store.as_ref(), &fallback.partition, &key).await
            {
                debug!(url = %request.url, fallback = %document, "Serving fallback document");
                return Ok(response);
            }
        }

        Err(OfflineError::navigation_failed(
            request.url.as_str(),
            Some(error),
        ))
    }

    /// Network step: fetch, storing a clone of 2xx responses.
    async fn network_step(&self, request: &Request, partition: &str) -> Resolution {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    let key = CacheKey::get(&request.url);
                    store_response(self.store.as_ref(), partition, &key, &response).await;
                } else {
                    debug!(url = %request.url, status = %response.status, "Not caching non-2xx response");
                }
                Resolution::Hit(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network unavailable");
                Resolution::Miss
            }
        }
    }
}

/// Cache step. Storage failures read as a miss.
async fn lookup(store: &dyn PartitionStore, partition: &str, key: &CacheKey) -> Resolution {
    let found = match store.open(partition).await {
        Ok(handle) => store.get(&handle, key).await,
        Err(e) => Err(e),
    };

    match found {
        Ok(Some(entry)) => Resolution::Hit(restore(entry)),
        Ok(None) => Resolution::Miss,
        Err(e) => {
            warn!(partition, key = %key, error = %e, "Cache read failed, treating as miss");
            Resolution::Miss
        }
    }
}

/// Store a snapshot. Storage failures are logged and otherwise ignored.
async fn store_response(
    store: &dyn PartitionStore,
    partition: &str,
    key: &CacheKey,
    response: &Response,
) {
    let result = match store.open(partition).await {
        Ok(handle) => store.put(&handle, key, snapshot(response)).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => trace!(partition, key = %key, "Cached response"),
        Err(e) => warn!(partition, key = %key, error = %e, "Cache write failed"),
    }
}

/// Snapshot a response for storage. Header values that are not valid
/// UTF-8 are dropped.
pub(crate) fn snapshot(response: &Response) -> CacheEntry {
    let headers = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    CacheEntry::new(response.status.as_u16(), headers, response.body.to_vec())
}

/// Rebuild a response from a stored snapshot.
pub(crate) fn restore(entry: CacheEntry) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(name, value);
        }
    }

    Response {
        status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
        headers,
        body: entry.body.into(),
        source: ResponseSource::Cache,
    }
}

fn offline_json() -> Response {
    Response::synthetic_json(
        StatusCode::SERVICE_UNAVAILABLE,
        &json!({ "error": "Offline", "message": "No cached data available" }),
    )
}
