//! Queued mutating requests and their replay.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method};
use offcache_common::{OfflineError, Result};
use offcache_net::{Fetcher, Request};
use offcache_store::PendingSyncItem;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::sync_queue::SyncDelivery;

/// A mutating request captured for later delivery. Stored as the payload
/// of a sync item; the body is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub method: String,
    pub url: Url,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl MutationRecord {
    /// Capture a request. Header values that are not valid UTF-8 are dropped.
    pub fn from_request(request: &Request) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            url: request.url.clone(),
            headers: request
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: request.body.as_ref().map(|body| STANDARD.encode(body)),
        }
    }

    /// Rebuild the request for replay.
    pub fn to_request(&self) -> Result<Request> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| OfflineError::Serialization(format!("bad method {}: {e}", self.method)))?;
        let body = match &self.body {
            Some(encoded) => Some(Bytes::from(STANDARD.decode(encoded).map_err(|e| {
                OfflineError::Serialization(format!("bad body encoding: {e}"))
            })?)),
            None => None,
        };

        let mut request = Request::with_method(method, self.url.clone(), body);
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| OfflineError::Serialization(format!("bad header {name}: {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| OfflineError::Serialization(format!("bad header value: {e}")))?;
            request.headers.append(name, value);
        }
        Ok(request)
    }

    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Delivers queued [`MutationRecord`]s through a [`Fetcher`]. Only a 2xx
/// answer counts as delivered.
pub struct FetchDelivery {
    fetcher: Arc<dyn Fetcher>,
}

impl FetchDelivery {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl SyncDelivery for FetchDelivery {
    async fn deliver(&self, item: &PendingSyncItem) -> Result<()> {
        let record = MutationRecord::from_payload(&item.payload)?;
        let request = record.to_request()?;
        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(OfflineError::UpstreamStatus {
                status: response.status.as_u16(),
                url: record.url.to_string(),
            });
        }
        debug!(id = %item.id, method = %record.method, url = %record.url, "Replayed mutation");
        Ok(())
    }
}
