//! # PWA Cache
//!
//! Named request → response buckets, modelled on the host `caches` global.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     │   open / has / keys / delete / match
//!     │
//!     ├── Cache ("django-pwa-v…")
//!     │       └── CacheKey → CachedResponse
//!     │
//!     └── CacheBackend
//!             ├── MemoryCacheBackend
//!             └── DiskCacheBackend (one JSON file per bucket)
//! ```
//!
//! Only `GET` requests are storable or matchable. Keys are the request URL
//! without its fragment.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::join_all;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwa_net::{Fetcher, NetError, Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

pub mod disk;
pub mod memory;

pub use disk::DiskCacheBackend;
pub use memory::MemoryCacheBackend;

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Method not cacheable: {0}")]
    MethodNotAllowed(Method),

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: Url, status: StatusCode },

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ==================== Types ====================

/// Normalized request descriptor used as a bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a URL, ignoring its fragment.
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Key for a request. Only `GET` requests have one.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::from_url(&request.url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Final response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in wire order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Capture a network response.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the response.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.url).map_err(|e| CacheError::InvalidEntry(e.to_string()))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| CacheError::InvalidEntry(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| CacheError::InvalidEntry(e.to_string()))?;
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| CacheError::InvalidEntry(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone().into(),
        })
    }
}

/// A named bucket of entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheBucket {
    /// Bucket name.
    pub name: String,

    /// Creation order among buckets.
    pub seq: u64,

    /// Cached entries.
    pub entries: hashbrown::HashMap<CacheKey, CachedResponse>,
}

impl CacheBucket {
    pub fn new(name: &str, seq: u64) -> Self {
        Self {
            name: name.to_string(),
            seq,
            entries: hashbrown::HashMap::new(),
        }
    }
}

/// Status handling for [`Cache::add_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddAllPolicy {
    /// A non-2xx response fails the whole batch.
    #[default]
    RequireOk,
    /// Store whatever the network returned.
    StoreAny,
}

/// Options for [`CacheStorage::match_request`].
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    /// Only search this bucket.
    pub cache_name: Option<String>,
}

// ==================== Backend ====================

/// Persistence seam for cache buckets.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create a bucket if it does not exist.
    async fn create(&self, name: &str) -> Result<(), CacheError>;

    async fn contains(&self, name: &str) -> Result<bool, CacheError>;

    /// Bucket names in creation order.
    async fn names(&self) -> Result<Vec<String>, CacheError>;

    /// Remove a bucket. Returns whether it existed.
    async fn remove(&self, name: &str) -> Result<bool, CacheError>;

    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError>;

    /// Insert every entry or none of them.
    async fn insert_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CachedResponse)>,
    ) -> Result<(), CacheError>;

    async fn entry_keys(&self, name: &str) -> Result<Vec<CacheKey>, CacheError>;
}

// ==================== Cache Storage ====================

/// Cache storage (caches global).
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    /// Wrap a backend.
    pub fn new(backend: impl CacheBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Non-persistent storage.
    pub fn in_memory() -> Self {
        Self::new(MemoryCacheBackend::new())
    }

    /// Open a cache (creates if it doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache, CacheError> {
        self.backend.create(name).await?;
        Ok(Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.backend.contains(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.backend.remove(name).await
    }

    /// All cache names, oldest first.
    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.backend.names().await
    }

    /// Match a request in one cache, or across all caches in creation order.
    pub async fn match_request(
        &self,
        request: &Request,
        options: &MatchOptions,
    ) -> Result<Option<Response>, CacheError> {
        let Some(key) = CacheKey::for_request(request) else {
            return Ok(None);
        };

        let names = match options.cache_name {
            Some(ref name) => vec![name.clone()],
            None => self.backend.names().await?,
        };

        for name in names {
            match self.backend.get(&name, &key).await {
                Ok(Some(entry)) => return entry.to_response().map(Some),
                Ok(None) | Err(CacheError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

// ==================== Cache ====================

/// Handle to one named cache.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let Some(key) = CacheKey::for_request(request) else {
            return Ok(None);
        };
        match self.backend.get(&self.name, &key).await? {
            Some(entry) => entry.to_response().map(Some),
            None => Ok(None),
        }
    }

    /// Store a response under a request.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        let key = CacheKey::for_request(request)
            .ok_or_else(|| CacheError::MethodNotAllowed(request.method.clone()))?;
        self.backend
            .insert_all(&self.name, vec![(key, CachedResponse::from_response(response))])
            .await
    }

    /// Fetch every request and store the responses.
    ///
    /// All fetches run concurrently. Nothing is stored unless every request
    /// produced an acceptable response. Returns the number of entries stored.
    pub async fn add_all(
        &self,
        fetcher: &dyn Fetcher,
        requests: Vec<Request>,
        policy: AddAllPolicy,
    ) -> Result<usize, CacheError> {
        let mut keys = Vec::with_capacity(requests.len());
        for request in &requests {
            let key = CacheKey::for_request(request)
                .ok_or_else(|| CacheError::MethodNotAllowed(request.method.clone()))?;
            keys.push(key);
        }

        debug!(cache = %self.name, count = requests.len(), "Fetching entries");

        let results = join_all(requests.into_iter().map(|request| fetcher.fetch(request))).await;

        let mut entries = Vec::with_capacity(results.len());
        for (key, result) in keys.into_iter().zip(results) {
            let response = result?;
            if policy == AddAllPolicy::RequireOk && !response.ok() {
                return Err(CacheError::BadStatus {
                    url: response.url,
                    status: response.status,
                });
            }
            trace!(key = %key, status = %response.status, "Entry fetched");
            entries.push((key, CachedResponse::from_response(&response)));
        }

        let count = entries.len();
        self.backend.insert_all(&self.name, entries).await?;
        Ok(count)
    }

    /// Keys of every entry.
    pub async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        self.backend.entry_keys(&self.name).await
    }
}

// ==================== Helpers ====================

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticFetcher {
        statuses: Vec<(&'static str, u16)>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            self.calls.lock().unwrap().push(request.url.path().to_string());
            let status = self
                .statuses
                .iter()
                .find(|(path, _)| *path == request.url.path())
                .map(|(_, status)| *status)
                .ok_or_else(|| NetError::ConnectionFailed(request.url.to_string()))?;
            Ok(Response::new(
                request.url.clone(),
                StatusCode::from_u16(status).unwrap(),
                format!("body of {}", request.url.path()),
            ))
        }
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse("https://example.com").unwrap().join(path).unwrap())
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = CacheKey::from_url(&Url::parse("https://example.com/offline/#top").unwrap());
        let b = CacheKey::from_url(&Url::parse("https://example.com/offline/").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com/offline/");
    }

    #[test]
    fn test_cache_key_get_only() {
        let url = Url::parse("https://example.com/api/").unwrap();
        assert!(CacheKey::for_request(&Request::get(url.clone())).is_some());
        assert!(CacheKey::for_request(&Request::post(url, bytes::Bytes::new())).is_none());
    }

    #[test]
    fn test_cached_response_restores_response() {
        let response = Response::new(
            Url::parse("https://example.com/static/images/pwa_icon.png").unwrap(),
            StatusCode::OK,
            vec![0x89, b'P', b'N', b'G'],
        )
        .with_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("image/png"),
        );

        let restored = CachedResponse::from_response(&response).to_response().unwrap();
        assert_eq!(restored, response);
    }

    #[test]
    fn test_cached_response_body_is_base64_on_disk() {
        let entry = CachedResponse {
            url: "https://example.com/offline/".to_string(),
            status: 200,
            headers: Vec::new(),
            body: b"hi".to_vec(),
            cached_at: 0,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"aGk=\""));

        let back: CachedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let caches = CacheStorage::in_memory();

        assert!(!caches.has("v1").await.unwrap());
        caches.open("v1").await.unwrap();
        assert!(caches.has("v1").await.unwrap());

        assert!(caches.delete("v1").await.unwrap());
        assert!(!caches.has("v1").await.unwrap());
        assert!(!caches.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let caches = CacheStorage::in_memory();
        let cache = caches.open("v1").await.unwrap();
        let request = get("/style.css");
        let response = Response::new(request.url.clone(), StatusCode::OK, "body{}");

        cache.put(&request, &response).await.unwrap();

        assert_eq!(cache.match_request(&request).await.unwrap(), Some(response));
        assert!(cache.match_request(&get("/other.css")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_post() {
        let caches = CacheStorage::in_memory();
        let cache = caches.open("v1").await.unwrap();
        let request = Request::post(Url::parse("https://example.com/api/").unwrap(), "x".into());
        let response = Response::new(request.url.clone(), StatusCode::OK, "ok");

        let result = cache.put(&request, &response).await;
        assert!(matches!(result, Err(CacheError::MethodNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_match_across_caches_oldest_first() {
        let caches = CacheStorage::in_memory();
        let old = caches.open("old").await.unwrap();
        let new = caches.open("new").await.unwrap();
        let request = get("/offline/");

        old.put(&request, &Response::new(request.url.clone(), StatusCode::OK, "old"))
            .await
            .unwrap();
        new.put(&request, &Response::new(request.url.clone(), StatusCode::OK, "new"))
            .await
            .unwrap();

        let any = caches
            .match_request(&request, &MatchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(any.text().unwrap(), "old");

        let scoped = caches
            .match_request(
                &request,
                &MatchOptions {
                    cache_name: Some("new".to_string()),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped.text().unwrap(), "new");

        let missing = caches
            .match_request(
                &request,
                &MatchOptions {
                    cache_name: Some("gone".to_string()),
                },
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_add_all_stores_every_entry() {
        let fetcher = StaticFetcher {
            statuses: vec![("/a.js", 200), ("/b.js", 200)],
            calls: Mutex::new(Vec::new()),
        };
        let caches = CacheStorage::in_memory();
        let cache = caches.open("v1").await.unwrap();

        let stored = cache
            .add_all(&fetcher, vec![get("/a.js"), get("/b.js")], AddAllPolicy::RequireOk)
            .await
            .unwrap();

        assert_eq!(stored, 2);
        assert_eq!(cache.keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let fetcher = StaticFetcher {
            statuses: vec![("/a.js", 200)],
            calls: Mutex::new(Vec::new()),
        };
        let caches = CacheStorage::in_memory();
        let cache = caches.open("v1").await.unwrap();

        let result = cache
            .add_all(&fetcher, vec![get("/a.js"), get("/missing.js")], AddAllPolicy::RequireOk)
            .await;

        assert!(matches!(result, Err(CacheError::Network(_))));
        assert!(cache.keys().await.unwrap().is_empty());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_all_status_policy() {
        let fetcher = StaticFetcher {
            statuses: vec![("/ok.png", 200), ("/gone.png", 404)],
            calls: Mutex::new(Vec::new()),
        };
        let caches = CacheStorage::in_memory();
        let cache = caches.open("v1").await.unwrap();
        let requests = vec![get("/ok.png"), get("/gone.png")];

        let strict = cache
            .add_all(&fetcher, requests.clone(), AddAllPolicy::RequireOk)
            .await;
        assert!(matches!(strict, Err(CacheError::BadStatus { status, .. }) if status == StatusCode::NOT_FOUND));
        assert!(cache.keys().await.unwrap().is_empty());

        let lenient = cache
            .add_all(&fetcher, requests, AddAllPolicy::StoreAny)
            .await
            .unwrap();
        assert_eq!(lenient, 2);
        let gone = cache.match_request(&get("/gone.png")).await.unwrap().unwrap();
        assert_eq!(gone.status, StatusCode::NOT_FOUND);
    }
}
