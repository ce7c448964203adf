//! The offline cache agent.
//!
//! - install: open the current bucket and precache the asset list; a failed
//!   precache is logged and swallowed
//! - activate: delete every prefixed bucket except the current one
//! - fetch: network first, then the cached request, then the offline page

use std::sync::Arc;

use futures::future::join_all;
use pwa_cache::{CacheStorage, MatchOptions};
use pwa_net::{Fetcher, Request, Response};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AgentConfig, FallbackScope};
use crate::events::{ActivateEvent, FetchEvent, InstallEvent, ServiceWorkerHandlers};
use crate::ServiceWorkerError;

/// What an install did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Bucket that was opened.
    pub cache_name: String,
    /// Entries stored.
    pub cached: usize,
    /// Why precaching failed, if it did.
    pub error: Option<String>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// What an activation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
    /// Buckets that could not be deleted, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Where a fetch response came from.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Network(Response),
    Cache(Response),
    Fallback(Response),
}

impl FetchOutcome {
    pub fn response(&self) -> &Response {
        match self {
            FetchOutcome::Network(r) | FetchOutcome::Cache(r) | FetchOutcome::Fallback(r) => r,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            FetchOutcome::Network(r) | FetchOutcome::Cache(r) | FetchOutcome::Fallback(r) => r,
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            FetchOutcome::Network(_) => "network",
            FetchOutcome::Cache(_) => "cache",
            FetchOutcome::Fallback(_) => "fallback",
        }
    }
}

/// One loaded version of the agent.
#[derive(Clone)]
pub struct OfflineAgent {
    config: Arc<AgentConfig>,
    caches: CacheStorage,
    network: Arc<dyn Fetcher>,
}

impl OfflineAgent {
    pub fn new(config: AgentConfig, caches: CacheStorage, network: Arc<dyn Fetcher>) -> Self {
        info!(cache = config.cache_name(), origin = %config.origin(), "Agent loaded");
        Self {
            config: Arc::new(config),
            caches,
            network,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Open the current bucket and precache the asset list.
    ///
    /// Only a failure to open the bucket is an error. Precache failures are
    /// logged and reported in the returned [`InstallReport`].
    #[instrument(skip(self), fields(cache = %self.config.cache_name()))]
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let cache = self.caches.open(self.config.cache_name()).await?;

        info!(assets = self.config.precache().len(), "Caching files...");

        let requests: Vec<Request> = self
            .config
            .precache()
            .iter()
            .cloned()
            .map(Request::get)
            .collect();

        let (cached, error) = match cache
            .add_all(self.network.as_ref(), requests, self.config.precache_policy())
            .await
        {
            Ok(count) => (count, None),
            Err(e) => {
                error!(error = %e, "Cache addAll failed");
                (0, Some(e.to_string()))
            }
        };

        Ok(InstallReport {
            cache_name: cache.name().to_string(),
            cached,
            error,
        })
    }

    /// Delete every bucket left behind by other versions of this agent.
    ///
    /// Deletions run concurrently. A failed deletion is logged and reported;
    /// it does not stop the others.
    #[instrument(skip(self), fields(cache = %self.config.cache_name()))]
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .await?
            .into_iter()
            .filter(|name| self.config.is_stale_cache(name))
            .collect();

        let results = join_all(stale.iter().map(|name| self.caches.delete(name))).await;

        let mut report = ActivateReport::default();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    debug!(stale = %name, "Deleted old cache");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(stale = %name, error = %e, "Failed to delete old cache");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Old caches cleared"
        );
        Ok(report)
    }

    /// Answer a request: network, then cache, then the offline page.
    ///
    /// Returns [`ServiceWorkerError::Unfulfilled`] only when the network
    /// fails and neither the request nor the offline page is cached.
    pub async fn respond(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        let err = match self.network.fetch(request.clone()).await {
            Ok(response) => return Ok(FetchOutcome::Network(response)),
            Err(err) => err,
        };
        debug!(url = %request.url, error = %err, "Network failed, trying cache");

        let buckets = self.search_order().await;
        if let Some(response) = self.lookup(&buckets, &request).await {
            return Ok(FetchOutcome::Cache(response));
        }

        let offline = Request::get(self.config.offline_url().clone());
        if let Some(response) = self.lookup(&buckets, &offline).await {
            info!(url = %request.url, "Serving offline page");
            return Ok(FetchOutcome::Fallback(response));
        }

        warn!(url = %request.url, "No cached response and no offline page");
        Err(ServiceWorkerError::Unfulfilled(request.url))
    }

    /// Buckets searched on fallback, current first.
    async fn search_order(&self) -> Vec<String> {
        let current = self.config.cache_name().to_string();
        if self.config.fallback_scope() == FallbackScope::CurrentBucket {
            return vec![current];
        }

        let mut names = vec![current];
        match self.caches.keys().await {
            Ok(all) => names.extend(
                all.into_iter()
                    .filter(|name| self.config.is_stale_cache(name)),
            ),
            Err(e) => warn!(error = %e, "Listing caches failed"),
        }
        names
    }

    async fn lookup(&self, buckets: &[String], request: &Request) -> Option<Response> {
        for name in buckets {
            let options = MatchOptions {
                cache_name: Some(name.clone()),
            };
            match self.caches.match_request(request, &options).await {
                Ok(Some(response)) => return Some(response),
                Ok(None) => {}
                Err(e) => {
                    warn!(cache = ?options.cache_name, error = %e, "Cache lookup failed");
                }
            }
        }
        None
    }
}

impl ServiceWorkerHandlers for OfflineAgent {
    fn on_install(&self, event: &mut InstallEvent) {
        event.skip_waiting();
        let agent = self.clone();
        event.wait_until(async move { agent.install().await.map(|_| ()) });
    }

    fn on_activate(&self, event: &mut ActivateEvent) {
        let agent = self.clone();
        event.wait_until(async move { agent.activate().await.map(|_| ()) });
    }

    fn on_fetch(&self, event: &mut FetchEvent) {
        let agent = self.clone();
        let request = event.request().clone();
        let registered = event.respond_with(async move {
            agent
                .respond(request)
                .await
                .map(FetchOutcome::into_response)
        });
        if let Err(e) = registered {
            warn!(error = %e, "Fetch already answered");
        }
    }
}
