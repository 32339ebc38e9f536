//! File-backed cache for rendered HTML snapshots.
//!
//! An entry is a pair of sibling files: `{digest}.html` holds the payload
//! and `{digest}.html.meta` a JSON record with the expiry. An entry is valid
//! only while both files exist and the metadata has not expired; partial
//! pairs self-heal into a miss on the next read. All read-side failures
//! other than not-found are logged and downgraded to a miss.

use crate::error::CacheError;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Expiry sweeps process metadata files in fixed-size batches to bound the
/// number of concurrently open descriptors.
const CLEANUP_BATCH: usize = 100;

/// Cache fingerprint: SHA-256 hex of `"{device}:{url}"`.
pub fn fingerprint(url: &str, device: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device.as_bytes());
    hasher.update(b":");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMetadata {
    expires_at: u64,
    url: String,
    device_type: String,
}

/// Result of an expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed: usize,
    pub errors: usize,
}

/// Storage interface for rendered snapshots. The file-backed store is the
/// production implementation; tests substitute [`MemoryCache`].
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Returns the cached HTML, or `None` on miss, expiry, or any read
    /// failure.
    async fn get(&self, url: &str, device: &str) -> Option<String>;

    async fn set(
        &self,
        url: &str,
        html: &str,
        device: &str,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn invalidate(&self, url: &str, device: &str) -> Result<(), CacheError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Remove expired entries; never fails as a whole.
    async fn cleanup(&self) -> CleanupStats;

    /// Probe used by the health endpoint.
    async fn verify_writable(&self) -> Result<(), CacheError>;
}

/// The on-disk store. The cache directory is created lazily by the first
/// operation; the creation latch is shared so concurrent callers wait for a
/// single attempt, and a failed attempt resets the latch for a retry.
pub struct FileCache {
    dir: PathBuf,
    ready: Mutex<bool>,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ready: Mutex::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<(), CacheError> {
        let mut ready = self.ready.lock().await;
        if *ready {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::Directory(format!("{}: {e}", self.dir.display())))?;
        *ready = true;
        Ok(())
    }

    fn html_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.html"))
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.html.meta"))
    }

    async fn remove_pair(&self, meta_path: &Path) {
        let html_path = meta_path.with_extension("");
        if let Err(e) = tokio::fs::remove_file(&html_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", html_path.display(), e);
            }
        }
        if let Err(e) = tokio::fs::remove_file(meta_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", meta_path.display(), e);
            }
        }
    }

    /// Examine one metadata file during a sweep. `Ok(true)` means the entry
    /// was expired and removed.
    async fn sweep_one(&self, meta_path: PathBuf) -> Result<bool, CacheError> {
        let raw = tokio::fs::read_to_string(&meta_path).await?;
        let meta: CacheMetadata = serde_json::from_str(&raw)?;
        if now_millis() > meta.expires_at {
            self.remove_pair(&meta_path).await;
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl ContentCache for FileCache {
    async fn get(&self, url: &str, device: &str) -> Option<String> {
        if let Err(e) = self.ensure_dir().await {
            warn!("cache directory unavailable: {}", e);
            return None;
        }
        let digest = fingerprint(url, device);
        let meta_path = self.meta_path(&digest);
        let raw = match tokio::fs::read_to_string(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cache metadata read failed for {}: {}", digest, e);
                return None;
            }
        };
        let meta: CacheMetadata = match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("cache metadata corrupt for {}: {}", digest, e);
                return None;
            }
        };
        if now_millis() > meta.expires_at {
            debug!("cache entry expired for {}", meta.url);
            self.remove_pair(&meta_path).await;
            return None;
        }
        match tokio::fs::read_to_string(self.html_path(&digest)).await {
            Ok(html) => Some(html),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Dangling metadata without its payload: drop it.
                let _ = tokio::fs::remove_file(&meta_path).await;
                None
            }
            Err(e) => {
                warn!("cache payload read failed for {}: {}", digest, e);
                None
            }
        }
    }

    async fn set(
        &self,
        url: &str,
        html: &str,
        device: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.ensure_dir().await?;
        let digest = fingerprint(url, device);
        let meta = CacheMetadata {
            expires_at: now_millis() + ttl.as_millis() as u64,
            url: url.to_string(),
            device_type: device.to_string(),
        };
        let meta_json = serde_json::to_string(&meta)?;
        // No cross-file atomicity: a partial pair becomes a self-healing
        // miss on the next get.
        let (html_res, meta_res) = tokio::join!(
            tokio::fs::write(self.html_path(&digest), html),
            tokio::fs::write(self.meta_path(&digest), meta_json),
        );
        html_res?;
        meta_res?;
        Ok(())
    }

    async fn invalidate(&self, url: &str, device: &str) -> Result<(), CacheError> {
        let digest = fingerprint(url, device);
        self.remove_pair(&self.meta_path(&digest)).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_dir().await?;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".html") || name.ends_with(".meta") {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to remove {}: {}", entry.path().display(), e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        if let Err(e) = self.ensure_dir().await {
            warn!("cache cleanup skipped: {}", e);
            stats.errors += 1;
            return stats;
        }
        let mut meta_files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cache cleanup failed to list {}: {}", self.dir.display(), e);
                stats.errors += 1;
                return stats;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if entry.file_name().to_string_lossy().ends_with(".meta") {
                        meta_files.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("cache cleanup enumeration error: {}", e);
                    stats.errors += 1;
                    break;
                }
            }
        }
        for batch in meta_files.chunks(CLEANUP_BATCH) {
            let results = join_all(batch.iter().map(|path| self.sweep_one(path.clone()))).await;
            for result in results {
                match result {
                    Ok(true) => stats.removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("cache cleanup entry error: {}", e);
                        stats.errors += 1;
                    }
                }
            }
        }
        if stats.removed > 0 || stats.errors > 0 {
            debug!(
                removed = stats.removed,
                errors = stats.errors,
                "cache cleanup finished"
            );
        }
        stats
    }

    async fn verify_writable(&self) -> Result<(), CacheError> {
        self.ensure_dir().await?;
        let probe = self.dir.join(".writable-probe");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

/// Memory-backed implementation used by tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, String), (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn get(&self, url: &str, device: &str) -> Option<String> {
        let key = (url.to_string(), device.to_string());
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some((html, expires)) if *expires > Instant::now() => Some(html.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    async fn set(
        &self,
        url: &str,
        html: &str,
        device: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = (url.to_string(), device.to_string());
        self.entries
            .lock()
            .await
            .insert(key, (html.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, url: &str, device: &str) -> Result<(), CacheError> {
        let key = (url.to_string(), device.to_string());
        self.entries.lock().await.remove(&key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn cleanup(&self) -> CleanupStats {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > Instant::now());
        CleanupStats {
            removed: before - entries.len(),
            errors: 0,
        }
    }

    async fn verify_writable(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = fingerprint("https://app.example/", "desktop");
        let b = fingerprint("https://app.example/", "desktop");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint("https://app.example/x", "desktop"));
        assert_ne!(a, fingerprint("https://app.example/", "mobile"));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        cache
            .set("https://app.example/", "<html>hi</html>", "desktop", Duration::from_secs(60))
            .await
            .unwrap();
        let html = cache.get("https://app.example/", "desktop").await;
        assert_eq!(html.as_deref(), Some("<html>hi</html>"));
        // Device participates in the key.
        assert!(cache.get("https://app.example/", "mobile").await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_get() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        cache
            .set("https://app.example/", "<html/>", "desktop", Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("https://app.example/", "desktop").await.is_none());

        let digest = fingerprint("https://app.example/", "desktop");
        assert!(!tmp.path().join(format!("{digest}.html")).exists());
        assert!(!tmp.path().join(format!("{digest}.html.meta")).exists());
    }

    #[tokio::test]
    async fn dangling_metadata_self_heals() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        let digest = fingerprint("https://app.example/", "desktop");
        let meta = format!(
            r#"{{"expiresAt":{},"url":"https://app.example/","deviceType":"desktop"}}"#,
            now_millis() + 60_000
        );
        std::fs::write(tmp.path().join(format!("{digest}.html.meta")), meta).unwrap();

        assert!(cache.get("https://app.example/", "desktop").await.is_none());
        assert!(!tmp.path().join(format!("{digest}.html.meta")).exists());
    }

    #[tokio::test]
    async fn corrupt_metadata_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        let digest = fingerprint("https://app.example/", "desktop");
        std::fs::write(tmp.path().join(format!("{digest}.html.meta")), "not json").unwrap();
        std::fs::write(tmp.path().join(format!("{digest}.html")), "<html/>").unwrap();
        assert!(cache.get("https://app.example/", "desktop").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        cache
            .set("https://app.example/", "<html/>", "desktop", Duration::from_secs(60))
            .await
            .unwrap();
        cache.invalidate("https://app.example/", "desktop").await.unwrap();
        assert!(cache.get("https://app.example/", "desktop").await.is_none());
        // A second invalidate of a missing entry succeeds.
        cache.invalidate("https://app.example/", "desktop").await.unwrap();
    }

    #[tokio::test]
    async fn clear_removes_all_cache_files() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        for i in 0..5 {
            cache
                .set(
                    &format!("https://app.example/{i}"),
                    "<html/>",
                    "desktop",
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }
        std::fs::write(tmp.path().join("unrelated.txt"), "keep me").unwrap();
        cache.clear().await.unwrap();

        let leftover: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".html") || n.ends_with(".meta"))
            .collect();
        assert!(leftover.is_empty(), "leftover cache files: {leftover:?}");
        assert!(tmp.path().join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_entries() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        cache
            .set("https://app.example/old", "<html/>", "desktop", Duration::ZERO)
            .await
            .unwrap();
        cache
            .set("https://app.example/new", "<html/>", "desktop", Duration::from_secs(300))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = cache.cleanup().await;
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.errors, 0);
        assert!(cache.get("https://app.example/new", "desktop").await.is_some());
        assert!(cache.get("https://app.example/old", "desktop").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_counts_corrupt_metadata_as_error() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        std::fs::write(tmp.path().join("bad.html.meta"), "not json").unwrap();
        let stats = cache.cleanup().await;
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn writable_probe_succeeds_on_temp_dir() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path());
        cache.verify_writable().await.unwrap();
    }

    #[tokio::test]
    async fn memory_cache_honors_ttl_and_clear() {
        let cache = MemoryCache::new();
        cache
            .set("https://a/", "<a/>", "desktop", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("https://a/", "desktop").await.as_deref(), Some("<a/>"));
        cache.clear().await.unwrap();
        assert!(cache.get("https://a/", "desktop").await.is_none());
    }
}
