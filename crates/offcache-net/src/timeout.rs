//! Caller-level timeouts layered over any [`Fetcher`].
//!
//! The caching strategies never time out on their own. Hosts that want a
//! bound wrap their fetcher in [`TimeoutFetcher`]; an expired timer is then
//! reported like any other transport failure, so cache fallbacks still run.

use std::time::Duration;

use async_trait::async_trait;
use offcache_common::{with_timeout, Result};
use tracing::warn;

use crate::{Fetcher, Request, Response};

/// A [`Fetcher`] decorator that races each fetch against a timer.
pub struct TimeoutFetcher<F> {
    inner: F,
    timeout: Duration,
}

impl<F: Fetcher> TimeoutFetcher<F> {
    pub fn new(inner: F, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for TimeoutFetcher<F> {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        match with_timeout(self.timeout, || self.inner.fetch(request)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(url = %request.url, timeout = ?self.timeout, "Fetch timed out");
                Err(e)
            }
        }
    }
}
