//! # Offcache Net
//!
//! Request and response descriptors plus the network boundary consumed by the
//! caching engine.
//!
//! ## Design Goals
//!
//! 1. **Plain descriptors**: requests and responses are owned values that can
//!    be cloned into a cache without touching the network again
//! 2. **One seam**: everything that talks to the network goes through [`Fetcher`]
//! 3. **Transport failures are data**: connectivity loss, DNS failure and
//!    timeouts all surface as [`OfflineError::Transport`] or
//!    [`OfflineError::Timeout`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use offcache_common::{OfflineError, Result, ResultExt};
use reqwest::Client;
use tracing::{debug, trace};
use url::Url;

pub mod timeout;

pub use timeout::TimeoutFetcher;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Set by the host when the request is a top-level navigation.
    pub navigate: bool,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            navigate: false,
        }
    }

    /// Create a navigation GET request.
    pub fn navigation(url: Url) -> Self {
        Self {
            navigate: true,
            ..Self::get(url)
        }
    }

    /// Create a request with an arbitrary method and body.
    pub fn with_method(method: Method, url: Url, body: Option<Bytes>) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body,
            navigate: false,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this is a GET request.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    /// Whether the Accept header asks for HTML.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("text/html"))
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Network,
    Cache,
    /// Built by the engine because nothing else was available.
    Synthetic,
}

/// A response snapshot.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// Create a network response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// Create a synthetic plain-text response.
    pub fn synthetic_text(status: StatusCode, text: &str) -> Self {
        let mut response = Self::new(status, Bytes::copy_from_slice(text.as_bytes()));
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response.source = ResponseSource::Synthetic;
        response
    }

    /// Create a synthetic JSON response.
    pub fn synthetic_json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut response = Self::new(status, value.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.source = ResponseSource::Synthetic;
        response
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Re-tag the response source.
    pub fn from_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    /// Check if the response is cacheable (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// The network boundary.
///
/// Implementations return `Ok` for every HTTP answer, whatever its status,
/// and an error only when no answer arrived.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform a request.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        (**self).fetch(request).await
    }
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Connect timeout. Requests themselves are not bounded here.
    pub connect_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Offcache/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed [`Fetcher`].
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| OfflineError::config(format!("failed to build HTTP client: {e}")))?;

        debug!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .transport_context(format!("{} {}", request.method, request.url))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .transport_context(format!("reading body of {}", request.url))?;

        trace!(
            url = %request.url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            status,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_accepts_html() {
        let url = Url::parse("https://example.com/dashboard").unwrap();
        let request =
            Request::get(url.clone()).header(ACCEPT, HeaderValue::from_static("text/html,*/*"));
        assert!(request.accepts_html());

        let json = Request::get(url).header(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!json.accepts_html());
    }

    #[test]
    fn test_navigation_request_is_get() {
        let request = Request::navigation(Url::parse("https://example.com/").unwrap());
        assert!(request.navigate);
        assert!(request.is_get());
    }

    #[test]
    fn test_synthetic_json_response() {
        let response = Response::synthetic_json(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({ "error": "Offline" }),
        );
        assert_eq!(response.source, ResponseSource::Synthetic);
        assert!(!response.ok());
        assert_eq!(response.json().unwrap()["error"], "Offline");
        assert_eq!(
            response.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_http_fetcher_returns_any_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/styles.css"))
            .respond_with(ResponseTemplate::new(200).set_body_string("body{}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let base = Url::parse(&server.uri()).unwrap();

        let ok = fetcher
            .fetch(&Request::get(base.join("/styles.css").unwrap()))
            .await
            .unwrap();
        assert!(ok.ok());
        assert_eq!(ok.text(), "body{}");
        assert_eq!(ok.source, ResponseSource::Network);

        let missing = fetcher
            .fetch(&Request::get(base.join("/missing").unwrap()))
            .await
            .unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_fetcher_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/notes"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&server.uri()).unwrap().join("/api/notes").unwrap();
        let request = Request::with_method(Method::POST, url, Some(Bytes::from_static(b"{}")));

        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused_is_transport() {
        // Reserve a free port, then release it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/styles.css")).unwrap();

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let err = fetcher.fetch(&Request::get(url)).await.unwrap_err();
        assert!(err.is_transport());
    }
}
