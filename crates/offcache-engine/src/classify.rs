//! Request classification.
//!
//! Pure, deterministic mapping from a request to the category that decides
//! its caching strategy. Rules run in order and the first match wins:
//!
//! 1. static asset: app-shell path, assets prefix, or static extension
//! 2. API call: remote API origin or local API prefix
//! 3. navigation: navigation flag, or a GET that accepts HTML
//! 4. other

use hashbrown::HashSet;
use offcache_net::Request;
use serde::Serialize;

use crate::config::ClassifierConfig;

/// Request category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    StaticAsset,
    ApiCall,
    Navigation,
    Other,
}

/// A request paired with its category. Never persisted.
#[derive(Debug, Clone, Copy)]
pub struct ClassifiedRequest<'a> {
    pub request: &'a Request,
    pub category: Category,
}

/// What the engine does with a request.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    /// Not intercepted; the host sends it straight to the network.
    Bypass,
    /// Handled by the strategy for its category.
    Intercept(ClassifiedRequest<'a>),
}

/// Request classifier built from [`ClassifierConfig`].
#[derive(Debug, Clone)]
pub struct Classifier {
    shell_paths: HashSet<String>,
    asset_prefix: String,
    extensions: HashSet<String>,
    api_origins: Vec<String>,
    api_prefix: String,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            shell_paths: config.shell_paths.iter().cloned().collect(),
            asset_prefix: config.asset_prefix.clone(),
            extensions: config
                .static_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            api_origins: config.api_origins.clone(),
            api_prefix: config.api_prefix.clone(),
        }
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> Category {
        let path = request.url.path();

        if self.is_static(path) {
            Category::StaticAsset
        } else if self.is_api(request.url.as_str(), path) {
            Category::ApiCall
        } else if request.navigate || (request.is_get() && request.accepts_html()) {
            Category::Navigation
        } else {
            Category::Other
        }
    }

    /// Decide whether the engine handles a request at all. Only GET is
    /// intercepted.
    pub fn route<'a>(&self, request: &'a Request) -> Route<'a> {
        if !request.is_get() {
            return Route::Bypass;
        }
        Route::Intercept(ClassifiedRequest {
            request,
            category: self.classify(request),
        })
    }

    fn is_static(&self, path: &str) -> bool {
        if self.shell_paths.contains(path) {
            return true;
        }
        if !self.asset_prefix.is_empty() && path.starts_with(&self.asset_prefix) {
            return true;
        }
        extension(path)
            .map(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    fn is_api(&self, url: &str, path: &str) -> bool {
        self.api_origins.iter().any(|origin| url.starts_with(origin.as_str()))
            || (!self.api_prefix.is_empty() && path.starts_with(&self.api_prefix))
    }
}

/// Extension of the last path segment, if it has one.
fn extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}
