//! Directory-backed cache backend.
//!
//! Each bucket lives in `<dir>/<url-encoded name>.json`. Reads are served
//! from memory; every mutation rewrites the affected bucket file through a
//! temporary file and a rename, and reaches memory only once the file is
//! written.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::memory::MemoryCacheBackend;
use crate::{CacheBackend, CacheBucket, CacheError, CacheKey, CachedResponse};

const EXTENSION: &str = "json";

/// Buckets persisted under a directory.
pub struct DiskCacheBackend {
    dir: PathBuf,
    memory: MemoryCacheBackend,
    write_lock: Mutex<()>,
}

impl DiskCacheBackend {
    /// Open (creating if needed) a cache directory and load its buckets.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut buckets = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match read_bucket(&path).await {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bucket"),
            }
        }

        info!(dir = %dir.display(), buckets = buckets.len(), "Cache directory loaded");

        Ok(Self {
            dir,
            memory: MemoryCacheBackend::from_buckets(buckets),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(name), EXTENSION))
    }

    async fn write_bucket(&self, bucket: &CacheBucket) -> Result<(), CacheError> {
        let path = self.bucket_path(&bucket.name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(bucket)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(cache = %bucket.name, entries = bucket.entries.len(), "Bucket persisted");
        Ok(())
    }
}

async fn read_bucket(path: &Path) -> Result<CacheBucket, CacheError> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl CacheBackend for DiskCacheBackend {
    async fn create(&self, name: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        if self.memory.contains(name).await? {
            return Ok(());
        }
        self.memory.create(name).await?;
        let Some(bucket) = self.memory.snapshot(name).await else {
            return Ok(());
        };
        if let Err(e) = self.write_bucket(&bucket).await {
            self.memory.remove(name).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn contains(&self, name: &str) -> Result<bool, CacheError> {
        self.memory.contains(name).await
    }

    async fn names(&self) -> Result<Vec<String>, CacheError> {
        self.memory.names().await
    }

    async fn remove(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock().await;
        let path = self.bucket_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.memory.remove(name).await
    }

    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        self.memory.get(name, key).await
    }

    async fn insert_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CachedResponse)>,
    ) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut bucket = self
            .memory
            .snapshot(name)
            .await
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        bucket.entries.extend(entries.iter().cloned());

        // Memory only sees entries that reached disk.
        self.write_bucket(&bucket).await?;
        self.memory.insert_all(name, entries).await
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<CacheKey>, CacheError> {
        self.memory.entry_keys(name).await
    }
}
