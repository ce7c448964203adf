//! Agent configuration.
//!
//! An [`AgentConfig`] is built once per agent load and never changes. Each
//! load stamps a fresh [`VersionToken`], so each load owns its own bucket.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use pwa_cache::AddAllPolicy;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::ServiceWorkerError;

/// Naming prefix shared by every bucket this agent owns.
pub const CACHE_PREFIX: &str = "django-pwa-";

/// Page served when neither network nor cache can answer.
pub const OFFLINE_PATH: &str = "/offline/";

/// Assets stored during install.
pub const PRECACHE_ASSETS: [&str; 3] = [
    "/offline/",
    "/static/images/pwa_icon.png",
    "/static/images/pwa_icon_512.png",
];

// ==================== Version Token ====================

/// Per-load version, rendered as `v<unix millis>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionToken(u64);

impl VersionToken {
    /// A token strictly greater than any generated before in this process.
    pub fn generate() -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut last = LAST.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ==================== Settings ====================

/// Where the fetch fallback looks for a cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackScope {
    /// Every bucket carrying the agent prefix, current bucket first.
    #[default]
    AgentBuckets,
    /// Only the current version's bucket.
    CurrentBucket,
}

/// File-level overrides for the agent constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Origin the asset paths are resolved against.
    pub origin: Option<Url>,
    pub cache_prefix: String,
    pub precache: Vec<String>,
    pub offline_path: String,
    pub fallback_scope: FallbackScope,
    pub precache_policy: AddAllPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            origin: None,
            cache_prefix: CACHE_PREFIX.to_string(),
            precache: PRECACHE_ASSETS.iter().map(|p| p.to_string()).collect(),
            offline_path: OFFLINE_PATH.to_string(),
            fallback_scope: FallbackScope::default(),
            precache_policy: AddAllPolicy::default(),
        }
    }
}

impl AgentSettings {
    /// Parse settings from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::Config(e.to_string()))
    }

    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }
}

// ==================== Agent Config ====================

/// Immutable configuration for one agent load.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    origin: Url,
    cache_prefix: String,
    version: VersionToken,
    cache_name: String,
    precache: Vec<Url>,
    offline_url: Url,
    fallback_scope: FallbackScope,
    precache_policy: AddAllPolicy,
}

impl AgentConfig {
    /// Default django-pwa configuration for an origin, with a fresh version.
    pub fn new(origin: Url) -> Result<Self, ServiceWorkerError> {
        Self::from_settings(AgentSettings {
            origin: Some(origin),
            ..AgentSettings::default()
        })
    }

    /// Build from settings, stamping a fresh version.
    pub fn from_settings(settings: AgentSettings) -> Result<Self, ServiceWorkerError> {
        Self::with_version(settings, VersionToken::generate())
    }

    /// Build from settings with an explicit version.
    pub fn with_version(
        settings: AgentSettings,
        version: VersionToken,
    ) -> Result<Self, ServiceWorkerError> {
        let origin = settings
            .origin
            .ok_or_else(|| ServiceWorkerError::Config("origin is required".to_string()))?;

        if origin.cannot_be_a_base() {
            return Err(ServiceWorkerError::Config(format!(
                "origin cannot resolve paths: {origin}"
            )));
        }
        if settings.cache_prefix.is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache prefix must not be empty".to_string(),
            ));
        }

        let resolve = |path: &str| {
            origin
                .join(path)
                .map_err(|e| ServiceWorkerError::Config(format!("invalid path {path}: {e}")))
        };

        let precache = settings
            .precache
            .iter()
            .map(|path| resolve(path.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let offline_url = resolve(settings.offline_path.as_str())?;

        if !precache.contains(&offline_url) {
            warn!(offline = %offline_url, "Offline page is not in the precache list");
        }

        Ok(Self {
            cache_name: format!("{}{}", settings.cache_prefix, version),
            origin,
            cache_prefix: settings.cache_prefix,
            version,
            precache,
            offline_url,
            fallback_scope: settings.fallback_scope,
            precache_policy: settings.precache_policy,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn cache_prefix(&self) -> &str {
        &self.cache_prefix
    }

    pub fn version(&self) -> VersionToken {
        self.version
    }

    /// Name of this load's bucket.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Absolute URLs to precache, in order.
    pub fn precache(&self) -> &[Url] {
        &self.precache
    }

    pub fn offline_url(&self) -> &Url {
        &self.offline_url
    }

    pub fn fallback_scope(&self) -> FallbackScope {
        self.fallback_scope
    }

    pub fn precache_policy(&self) -> AddAllPolicy {
        self.precache_policy
    }

    /// Whether a bucket carries this agent's prefix.
    pub fn owns_cache(&self, name: &str) -> bool {
        name.starts_with(&self.cache_prefix)
    }

    /// Whether a bucket was left behind by another version of this agent.
    pub fn is_stale_cache(&self, name: &str) -> bool {
        self.owns_cache(name) && name != self.cache_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://avarias.example.com/").unwrap()
    }

    #[test]
    fn test_version_tokens_strictly_increase() {
        let tokens: Vec<VersionToken> = (0..100).map(|_| VersionToken::generate()).collect();
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(VersionToken::from_millis(1697040000000).to_string(), "v1697040000000");
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::with_version(
            AgentSettings {
                origin: Some(origin()),
                ..Default::default()
            },
            VersionToken::from_millis(42),
        )
        .unwrap();

        assert_eq!(config.cache_name(), "django-pwa-v42");
        assert_eq!(config.offline_url().as_str(), "https://avarias.example.com/offline/");
        let paths: Vec<&str> = config.precache().iter().map(|u| u.path()).collect();
        assert_eq!(paths, PRECACHE_ASSETS.to_vec());
        assert_eq!(config.fallback_scope(), FallbackScope::AgentBuckets);
        assert_eq!(config.precache_policy(), AddAllPolicy::RequireOk);
    }

    #[test]
    fn test_fresh_versions_get_fresh_buckets() {
        let a = AgentConfig::new(origin()).unwrap();
        let b = AgentConfig::new(origin()).unwrap();
        assert_ne!(a.cache_name(), b.cache_name());
        assert!(a.version() < b.version());
    }

    #[test]
    fn test_cache_ownership() {
        let config = AgentConfig::with_version(
            AgentSettings {
                origin: Some(origin()),
                ..Default::default()
            },
            VersionToken::from_millis(2),
        )
        .unwrap();

        assert!(config.owns_cache("django-pwa-v1"));
        assert!(config.is_stale_cache("django-pwa-v1"));
        assert!(!config.is_stale_cache("django-pwa-v2"));
        assert!(!config.is_stale_cache("workbox-precache"));
    }

    #[test]
    fn test_origin_required() {
        let result = AgentConfig::from_settings(AgentSettings::default());
        assert!(matches!(result, Err(ServiceWorkerError::Config(_))));
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let result = AgentConfig::from_settings(AgentSettings {
            origin: Some(origin()),
            cache_prefix: String::new(),
            ..Default::default()
        });
        assert!(matches!(result, Err(ServiceWorkerError::Config(_))));
    }

    #[test]
    fn test_settings_from_json() {
        let settings = AgentSettings::from_json(
            r#"{
                "origin": "http://localhost:8000/",
                "fallback_scope": "current_bucket",
                "precache_policy": "store_any"
            }"#,
        )
        .unwrap();

        assert_eq!(settings.origin, Some(Url::parse("http://localhost:8000/").unwrap()));
        assert_eq!(settings.cache_prefix, CACHE_PREFIX);
        assert_eq!(settings.precache.len(), 3);
        assert_eq!(settings.fallback_scope, FallbackScope::CurrentBucket);
        assert_eq!(settings.precache_policy, AddAllPolicy::StoreAny);
    }

    #[test]
    fn test_settings_rejects_unknown_scope() {
        let result = AgentSettings::from_json(r#"{ "fallback_scope": "everywhere" }"#);
        assert!(matches!(result, Err(ServiceWorkerError::Config(_))));
    }
}
