//! Probe for the django-pwa offline agent.
//!
//! Runs one agent load against a live origin: install, activate, then fetch
//! each requested path, and prints what happened as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Install against a dev server and fetch two pages
//! pwa-probe run --origin http://localhost:8000/ / /about/
//!
//! # Same, but keep buckets on disk and answer the fetches offline
//! pwa-probe run --origin http://localhost:8000/ --cache-dir .pwa-cache --offline /
//!
//! # Show what is stored
//! pwa-probe list --cache-dir .pwa-cache
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pwa_cache::{CacheError, CacheStorage, DiskCacheBackend};
use pwa_common::{init_logging, LogConfig, LogFormat, PwaError};
use pwa_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, Response};
use pwa_sw::{AgentConfig, AgentSettings, OfflineAgent};
use serde::Serialize;
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "pwa-probe")]
#[command(about = "Drive the django-pwa offline agent against a live origin")]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate one agent load, then fetch paths through it
    Run {
        /// Site origin the asset paths resolve against
        #[arg(long)]
        origin: Url,
        /// JSON settings file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Persist buckets in this directory instead of memory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Cut the network after activation
        #[arg(long)]
        offline: bool,
        /// Paths to fetch after activation
        #[arg(default_value = "/")]
        paths: Vec<String>,
    },

    /// List buckets stored in a cache directory
    List {
        /// Cache directory
        #[arg(long)]
        cache_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format));

    let result = match cli.command {
        Commands::Run {
            origin,
            config,
            cache_dir,
            offline,
            paths,
        } => run(origin, config.as_deref(), cache_dir, offline, &paths).await,
        Commands::List { cache_dir } => list(&cache_dir).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(category = e.category(), retryable = e.is_retryable(), "{}", e);
            ExitCode::FAILURE
        }
    }
}

// ==================== Reports ====================

#[derive(Debug, Serialize)]
struct ProbeReport {
    cache_name: String,
    cached: usize,
    install_error: Option<String>,
    deleted: Vec<String>,
    delete_failures: Vec<String>,
    fetches: Vec<FetchReport>,
}

#[derive(Debug, Serialize)]
struct FetchReport {
    path: String,
    source: Option<&'static str>,
    status: Option<u16>,
    bytes: usize,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BucketSummary {
    name: String,
    entries: usize,
}

// ==================== Network ====================

/// Fetcher that can be cut off mid-run.
struct Switchable {
    inner: Arc<dyn Fetcher>,
    offline: AtomicBool,
}

impl Switchable {
    fn new(inner: Arc<dyn Fetcher>) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
        }
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for Switchable {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::ConnectionFailed(format!(
                "probe offline: {}",
                request.url
            )));
        }
        self.inner.fetch(request).await
    }
}

// ==================== Commands ====================

async fn run(
    origin: Url,
    config: Option<&Path>,
    cache_dir: Option<PathBuf>,
    offline: bool,
    paths: &[String],
) -> pwa_common::Result<()> {
    let mut settings = match config {
        Some(path) => AgentSettings::load(path)?,
        None => AgentSettings::default(),
    };
    settings.origin = Some(origin);

    let caches = open_storage(cache_dir).await?;
    let http = HttpFetcher::new(LoaderConfig::default())
        .map_err(|e| PwaError::network_with_source("building HTTP client", e))?;
    let network = Arc::new(Switchable::new(Arc::new(http)));

    let report = probe(settings, caches, network, offline, paths).await?;
    print_json(&report)
}

async fn list(cache_dir: &Path) -> pwa_common::Result<()> {
    let caches = open_storage(Some(cache_dir.to_path_buf())).await?;
    let buckets = summarize(&caches).await?;
    print_json(&buckets)
}

async fn probe(
    settings: AgentSettings,
    caches: CacheStorage,
    network: Arc<Switchable>,
    offline: bool,
    paths: &[String],
) -> pwa_common::Result<ProbeReport> {
    let config = AgentConfig::from_settings(settings)?;
    let origin = config.origin().clone();
    let agent = OfflineAgent::new(config, caches, Arc::clone(&network) as Arc<dyn Fetcher>);

    let install = agent.install().await?;
    let activate = agent.activate().await?;

    if offline {
        info!("Network cut");
        network.go_offline();
    }

    let mut fetches = Vec::with_capacity(paths.len());
    for path in paths {
        let url = origin
            .join(path)
            .map_err(|e| PwaError::InvalidArgument(format!("{path}: {e}")))?;

        let report = match agent.respond(Request::get(url)).await {
            Ok(outcome) => FetchReport {
                path: path.clone(),
                source: Some(outcome.source()),
                status: Some(outcome.response().status.as_u16()),
                bytes: outcome.response().body.len(),
                error: None,
            },
            Err(e) => FetchReport {
                path: path.clone(),
                source: None,
                status: None,
                bytes: 0,
                error: Some(e.to_string()),
            },
        };
        fetches.push(report);
    }

    Ok(ProbeReport {
        cache_name: install.cache_name,
        cached: install.cached,
        install_error: install.error,
        deleted: activate.deleted,
        delete_failures: activate
            .failed
            .into_iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect(),
        fetches,
    })
}

async fn open_storage(cache_dir: Option<PathBuf>) -> pwa_common::Result<CacheStorage> {
    match cache_dir {
        Some(dir) => {
            let backend = DiskCacheBackend::open(dir)
                .await
                .map_err(|e| PwaError::cache_with_source("opening cache directory", e))?;
            Ok(CacheStorage::new(backend))
        }
        None => Ok(CacheStorage::in_memory()),
    }
}

async fn summarize(caches: &CacheStorage) -> pwa_common::Result<Vec<BucketSummary>> {
    let wrap = |e: CacheError| PwaError::cache_with_source("reading buckets", e);

    let mut buckets = Vec::new();
    for name in caches.keys().await.map_err(wrap)? {
        let entries = caches
            .open(&name)
            .await
            .map_err(wrap)?
            .keys()
            .await
            .map_err(wrap)?
            .len();
        buckets.push(BucketSummary { name, entries });
    }
    Ok(buckets)
}

fn print_json<T: Serialize>(value: &T) -> pwa_common::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PwaError::internal(format!("encoding report: {e}")))?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    struct StaticSite;

    #[async_trait]
    impl Fetcher for StaticSite {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            Ok(Response::new(request.url, StatusCode::OK, "content"))
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            origin: Some(Url::parse("http://localhost:8000/").unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_probe_online_then_offline() {
        let caches = CacheStorage::in_memory();
        let network = Arc::new(Switchable::new(Arc::new(StaticSite)));
        let paths = vec!["/offline/".to_string(), "/page/".to_string()];

        let report = probe(settings(), caches, network, true, &paths)
            .await
            .unwrap();

        assert_eq!(report.cached, 3);
        assert!(report.install_error.is_none());
        assert_eq!(report.fetches[0].source, Some("cache"));
        assert_eq!(report.fetches[1].source, Some("fallback"));
        assert_eq!(report.fetches[1].bytes, "content".len());
    }

    #[tokio::test]
    async fn test_list_disk_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let caches = open_storage(Some(dir.path().to_path_buf())).await.unwrap();
        let network = Arc::new(Switchable::new(Arc::new(StaticSite)));
        let report = probe(settings(), caches, network, false, &[])
            .await
            .unwrap();

        let reopened = open_storage(Some(dir.path().to_path_buf())).await.unwrap();
        let buckets = summarize(&reopened).await.unwrap();

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, report.cache_name);
        assert_eq!(buckets[0].entries, 3);
    }
}
