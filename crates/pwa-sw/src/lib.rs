//! # PWA Service Worker
//!
//! The django-pwa offline cache agent and a minimal host that drives it.
//!
//! ## Features
//!
//! - **Install**: precache the offline page and icons into a versioned bucket
//! - **Activate**: purge buckets left behind by earlier versions
//! - **Fetch**: network first, then cache, then the offline page
//! - **Host**: registration lifecycle, extendable events, fetch dispatch
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     │   register() ──► InstallEvent ──► ActivateEvent
//!     │   fetch()    ──► FetchEvent
//!     │
//!     └── Registration
//!             ├── installing (ServiceWorker)
//!             ├── waiting (ServiceWorker)
//!             └── active (ServiceWorker + handlers)
//!
//! OfflineAgent (ServiceWorkerHandlers)
//!     ├── AgentConfig ("django-pwa-v…", assets, /offline/)
//!     ├── CacheStorage
//!     └── Fetcher
//! ```

use pwa_cache::CacheError;
use pwa_common::PwaError;
use pwa_net::NetError;
use thiserror::Error;
use url::Url;

pub mod agent;
pub mod config;
pub mod events;
pub mod host;

pub use agent::{ActivateReport, FetchOutcome, InstallReport, OfflineAgent};
pub use config::{
    AgentConfig, AgentSettings, FallbackScope, VersionToken, CACHE_PREFIX, OFFLINE_PATH,
    PRECACHE_ASSETS,
};
pub use events::{
    ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent, ServiceWorkerHandlers,
};
pub use host::{
    ServiceWorker, ServiceWorkerEvent, ServiceWorkerHost, ServiceWorkerId, ServiceWorkerState,
};
pub use pwa_cache::AddAllPolicy;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("No response available for {0}")]
    Unfulfilled(Url),

    #[error(transparent)]
    Common(#[from] PwaError),
}

impl From<ServiceWorkerError> for PwaError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Common(inner) => inner,
            ServiceWorkerError::Network(e) => PwaError::network_with_source("fetch failed", e),
            ServiceWorkerError::Cache(e) => PwaError::cache_with_source("cache storage failed", e),
            ServiceWorkerError::Config(message) => PwaError::config(message),
            ServiceWorkerError::Unfulfilled(url) => PwaError::NotFound(url.to_string()),
            other @ ServiceWorkerError::StateError(_) => {
                PwaError::lifecycle_with_source("worker lifecycle", other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_keeps_category() {
        let url = Url::parse("https://example.com/page/").unwrap();
        let err: PwaError = ServiceWorkerError::Unfulfilled(url).into();
        assert_eq!(err.category(), "not_found");

        let err: PwaError = ServiceWorkerError::Config("bad origin".into()).into();
        assert_eq!(err.category(), "config");

        let err: PwaError = ServiceWorkerError::StateError("no waiting worker".into()).into();
        assert_eq!(err.category(), "lifecycle");
    }
}
