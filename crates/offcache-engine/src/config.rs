//! Engine configuration.
//!
//! Everything the engine needs to know about the deployed application lives
//! here and is passed in at construction, so several engines with different
//! settings can coexist in one process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use offcache_common::{OfflineError, Result, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

/// The partitions the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// App shell and static assets.
    Static,
    /// Everything cached opportunistically.
    Dynamic,
    /// API responses.
    Api,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 3] = [Self::Static, Self::Dynamic, Self::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Api => "api",
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Request classification rules
    pub classifier: ClassifierConfig,

    /// Partition naming
    pub partitions: PartitionConfig,

    /// Size bounds and sweep period
    pub eviction: EvictionConfig,

    /// App shell install and navigation fallback
    pub lifecycle: LifecycleConfig,

    /// Sync log and install retry settings
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Paths that are part of the app shell
    pub shell_paths: Vec<String>,

    /// Path prefix of static assets
    pub asset_prefix: String,

    /// File extensions treated as static assets
    pub static_extensions: Vec<String>,

    /// Remote API origins (full URL prefixes)
    pub api_origins: Vec<String>,

    /// Path prefix of the local API
    pub api_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Version embedded in every partition's storage name. Changing it
    /// orphans the previous partitions.
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Seconds between sweeps
    pub period_secs: u64,

    /// Maximum item count per partition
    pub limits: BTreeMap<PartitionKind, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Origin the app shell paths are resolved against
    pub origin: Url,

    /// Resources that must be cached at install
    pub app_shell: Vec<String>,

    /// Document served when a navigation fails
    pub offline_fallback: String,

    /// Shell document served when the fallback is missing too
    pub shell_root: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Database holding partitions and the sync log
    pub database_path: PathBuf,

    /// Install attempts before giving up
    pub install_retry_attempts: u32,

    /// Delay before the first install retry, in milliseconds
    pub install_retry_delay_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            shell_paths: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/styles.css".to_string(),
                "/app.js".to_string(),
                "/manifest.json".to_string(),
                "/offline.html".to_string(),
            ],
            asset_prefix: "/icons/".to_string(),
            static_extensions: ["css", "js", "png", "jpg", "svg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            api_origins: vec!["https://jsonplaceholder.typicode.com/".to_string()],
            api_prefix: "/api/".to_string(),
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
        }
    }
}

impl PartitionConfig {
    /// Storage name of a partition at the configured version.
    pub fn storage_name(&self, kind: PartitionKind) -> String {
        format!("{}-{}", kind.as_str(), self.version)
    }

    /// Storage names of every known partition at the configured version.
    pub fn current_names(&self) -> Vec<String> {
        PartitionKind::ALL
            .iter()
            .map(|kind| self.storage_name(*kind))
            .collect()
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            limits: BTreeMap::from([(PartitionKind::Dynamic, 50), (PartitionKind::Api, 20)]),
        }
    }
}

impl EvictionConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8000/").expect("static origin is valid"),
            app_shell: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/styles.css".to_string(),
                "/app.js".to_string(),
                "/manifest.json".to_string(),
                "/offline.html".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            offline_fallback: "/offline.html".to_string(),
            shell_root: "/index.html".to_string(),
        }
    }
}

impl LifecycleConfig {
    /// Resolve a configured path or URL against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| OfflineError::config(format!("cannot resolve {path}: {e}")))
    }

    /// Every app shell entry as an absolute URL.
    pub fn app_shell_urls(&self) -> Result<Vec<Url>> {
        self.app_shell.iter().map(|p| self.resolve(p)).collect()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offcache")
                .join("offline.db"),
            install_retry_attempts: 3,
            install_retry_delay_ms: 500,
        }
    }
}

impl SyncConfig {
    /// Retry policy for app shell installation.
    pub fn install_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.install_retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.install_retry_delay_ms),
            ..RetryConfig::default()
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OfflineError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let version = self.partitions.version.trim();
        if version.is_empty() {
            return Err(OfflineError::config("partition version must not be empty"));
        }
        if version.contains(char::is_whitespace) {
            return Err(OfflineError::config(
                "partition version must not contain whitespace",
            ));
        }
        if self.eviction.period_secs == 0 {
            return Err(OfflineError::config("eviction period must be positive"));
        }
        if let Some((kind, _)) = self.eviction.limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(OfflineError::config(format!(
                "eviction limit for {} must be positive",
                kind.as_str()
            )));
        }
        if !self.classifier.api_prefix.starts_with('/') {
            return Err(OfflineError::config("api prefix must start with '/'"));
        }
        self.lifecycle.app_shell_urls()?;
        self.lifecycle.resolve(&self.lifecycle.offline_fallback)?;
        self.lifecycle.resolve(&self.lifecycle.shell_root)?;
        Ok(())
    }

    /// Storage name of a partition at the configured version.
    pub fn partition_name(&self, kind: PartitionKind) -> String {
        self.partitions.storage_name(kind)
    }
}
