//! Offcache smoke harness.
//!
//! Drives a real engine end to end against a live origin: installs and
//! activates the app shell, serves every URL given on the command line
//! through the engine, drains the sync queue, sweeps the caches and prints
//! a JSON verdict on stdout.
//!
//! ```text
//! offcache-smoke [--config engine.json] [--database offline.db]
//!                [--timeout-ms 8000] [--log-format json]
//!                [--perf-output perf.json] [--offline] URL...
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use offcache_common::{init_logging, LogConfig, LogFormat};
use offcache_engine::{
    DrainOutcome, EngineConfig, EngineEvent, EventReceiver, Interception, OfflineEngine,
};
use offcache_net::{Fetcher, HttpFetcher, LoaderConfig, Request, TimeoutFetcher};
use offcache_store::SqliteStore;
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let timings = self.timings.borrow();
        let mut summary = serde_json::Map::new();

        for (op, durations) in timings.iter() {
            if durations.is_empty() {
                continue;
            }

            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = millis.iter().sum();
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": millis.len(),
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / millis.len() as f64),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    database: Option<PathBuf>,
    timeout_ms: u64,
    log_format: LogFormat,
    perf_output: Option<PathBuf>,
    offline: bool,
    urls: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            database: None,
            timeout_ms: 8000,
            log_format: LogFormat::Pretty,
            perf_output: None,
            offline: false,
            urls: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next().map(PathBuf::from),
                "--database" => parsed.database = args.next().map(PathBuf::from),
                "--timeout-ms" => {
                    if let Some(val) = args.next() {
                        parsed.timeout_ms = val.parse().unwrap_or(8000);
                    }
                }
                "--log-format" => {
                    if let Some(val) = args.next() {
                        parsed.log_format = val.parse().unwrap_or(LogFormat::Pretty);
                    }
                }
                "--perf-output" => parsed.perf_output = args.next().map(PathBuf::from),
                "--offline" => parsed.offline = true,
                other => parsed.urls.push(other.to_string()),
            }
        }

        parsed
    }
}

/// Fetcher standing in for a disconnected network.
struct Disconnected;

#[async_trait::async_trait]
impl Fetcher for Disconnected {
    async fn fetch(&self, request: &Request) -> offcache_common::Result<offcache_net::Response> {
        Err(offcache_common::OfflineError::transport(format!(
            "offline: {}",
            request.url
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig::default().with_format(args.log_format))?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(database) = &args.database {
        config.sync.database_path = database.clone();
    }

    info!(
        config = ?args.config,
        database = %config.sync.database_path.display(),
        urls = args.urls.len(),
        offline = args.offline,
        "Starting offcache smoke harness"
    );

    let start = Instant::now();
    let perf = PerfTiming::new();
    let outcome = run(&args, config, &perf).await;

    if let Some(perf_path) = &args.perf_output {
        let perf_json = json!({
            "timings": perf.summary(),
            "total_elapsed_ms": start.elapsed().as_millis()
        });
        if let Err(e) = std::fs::write(perf_path, perf_json.to_string()) {
            error!(?e, "Failed to write perf output");
        } else {
            info!(?perf_path, "Perf summary written");
        }
    }

    let result = match outcome {
        Ok(mut report) => {
            report["status"] = json!("pass");
            report["elapsed_ms"] = json!(start.elapsed().as_millis());
            report
        }
        Err(e) => {
            error!(error = %e, "Smoke run failed");
            json!({
                "status": "fail",
                "reason": format!("{e:#}"),
                "elapsed_ms": start.elapsed().as_millis()
            })
        }
    };
    println!("{}", result);
    Ok(())
}

async fn run(args: &Args, config: EngineConfig, perf: &PerfTiming) -> Result<serde_json::Value> {
    if let Some(parent) = config.sync.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteStore::new(&config.sync.database_path).context("opening offline database")?,
    );

    let fetcher: Arc<dyn Fetcher> = if args.offline {
        Arc::new(Disconnected)
    } else {
        let http = HttpFetcher::new(LoaderConfig::default())?;
        Arc::new(TimeoutFetcher::new(http, Duration::from_millis(args.timeout_ms)))
    };

    let origin = config.lifecycle.origin.clone();
    let (engine, mut events) = OfflineEngine::new(config, store.clone(), store, fetcher)?;

    let t = Instant::now();
    let installed = match engine.install().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, "Install failed, continuing with existing caches");
            None
        }
    };
    perf.record("install", t.elapsed());

    let deleted = if installed.is_some() {
        let t = Instant::now();
        let deleted = engine.activate().await?;
        perf.record("activate", t.elapsed());
        deleted
    } else {
        Vec::new()
    };

    let mut fetches = Vec::with_capacity(args.urls.len());
    for raw in &args.urls {
        let url = origin
            .join(raw)
            .or_else(|_| Url::parse(raw))
            .with_context(|| format!("invalid URL {raw}"))?;
        let request = Request::get(url.clone());

        let t = Instant::now();
        let entry = match engine.handle_fetch(&request).await {
            Ok(Interception::Respond(response)) => json!({
                "url": url.as_str(),
                "status": response.status.as_u16(),
                "source": format!("{:?}", response.source),
                "bytes": response.body.len(),
            }),
            Ok(Interception::PassThrough) => json!({ "url": url.as_str(), "passthrough": true }),
            Err(e) => json!({
                "url": url.as_str(),
                "error": e.to_string(),
                "category": e.category(),
            }),
        };
        perf.record("handle_fetch", t.elapsed());
        fetches.push(entry);
    }

    let t = Instant::now();
    let drain = match engine.drain().await? {
        DrainOutcome::Completed(report) => serde_json::to_value(report)?,
        DrainOutcome::AlreadyRunning => json!("already-running"),
    };
    perf.record("drain", t.elapsed());

    let evicted = engine.sweep().await;

    Ok(json!({
        "installed": installed,
        "deleted_partitions": deleted,
        "fetches": fetches,
        "drain": drain,
        "evicted": evicted,
        "events": collect_events(&mut events),
    }))
}

fn collect_events(events: &mut EventReceiver) -> Vec<EngineEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}
