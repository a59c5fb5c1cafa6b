//! Two-tier TTL cache
//!
//! Reads check the in-process tier first and fall back to
//! `cache/<namespace>/<key>.json`. Live disk entries are promoted to memory
//! with the expiry recorded on disk. Writes go to both tiers; a failed disk
//! write is counted and logged but never fails the call.

use crate::entry::{entry_path, namespace_dir, validate_namespace, CacheEntry};
use crate::stats::{CacheStatistics, CacheStats, CleanupReport};
use chrono::Utc;
use dashmap::DashMap;
use filebridge_core::{Error, Result};
use filebridge_utils::tracing::cache_event;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    namespace: String,
    key: String,
}

impl EntryKey {
    fn new(namespace: &str, key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
        }
    }
}

struct CacheInner {
    base_dir: PathBuf,
    default_ttl: Duration,
    memory: DashMap<EntryKey, Arc<CacheEntry>>,
    stats: CacheStats,
    cleanup_handle: RwLock<Option<JoinHandle<()>>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.write().take() {
            handle.abort();
        }
    }
}

/// Two-tier cache shared by cloning
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("base_dir", &self.inner.base_dir)
            .field("memory_entries", &self.inner.memory.len())
            .finish()
    }
}

impl CacheManager {
    /// `base_dir` is the bridge's `cache/` directory
    pub fn new(base_dir: impl Into<PathBuf>, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                base_dir: base_dir.into(),
                default_ttl,
                memory: DashMap::new(),
                stats: CacheStats::default(),
                cleanup_handle: RwLock::new(None),
            }),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Fetch a live value, or `None` on a miss
    pub async fn get<T>(&self, namespace: &str, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        validate_namespace(namespace)?;
        match self.lookup(namespace, key).await {
            Some(entry) => {
                self.inner.stats.record_hit();
                cache_event(namespace, key, true);
                Ok(Some(serde_json::from_value(entry.data.clone())?))
            }
            None => {
                self.inner.stats.record_miss();
                cache_event(namespace, key, false);
                Ok(None)
            }
        }
    }

    async fn lookup(&self, namespace: &str, key: &str) -> Option<Arc<CacheEntry>> {
        let id = EntryKey::new(namespace, key);

        if let Some(entry) = self.inner.memory.get(&id).map(|e| Arc::clone(e.value())) {
            if !entry.is_expired() {
                return Some(entry);
            }
            if self
                .inner
                .memory
                .remove_if(&id, |_, current| current.is_expired())
                .is_some()
            {
                self.inner.stats.record_evictions(1);
            }
        }

        let entry = self.load_from_disk(namespace, key).await?;
        let entry = Arc::new(entry);
        self.inner.memory.insert(id, Arc::clone(&entry));
        Some(entry)
    }

    async fn load_from_disk(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
        let path = entry_path(&self.inner.base_dir, namespace, key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read cache entry");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "removing corrupt cache entry");
                let _ = fs::remove_file(&path).await;
                return None;
            }
        };

        if entry.is_expired() {
            if fs::remove_file(&path).await.is_ok() {
                self.inner.stats.record_evictions(1);
            }
            return None;
        }

        Some(entry)
    }

    /// Store `value` in both tiers
    pub async fn set<T>(&self, namespace: &str, key: &str, value: &T, ttl: Duration) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        validate_namespace(namespace)?;
        let entry = CacheEntry::new(serde_json::to_value(value)?, ttl);

        self.inner
            .memory
            .insert(EntryKey::new(namespace, key), Arc::new(entry.clone()));
        self.inner.stats.record_write();

        let path = entry_path(&self.inner.base_dir, namespace, key);
        let write = match serde_json::to_vec_pretty(&entry) {
            Ok(bytes) => filebridge_utils::write_atomic_async(&path, &bytes).await,
            Err(e) => Err(Error::from(e)),
        };
        if let Err(e) = write {
            self.inner.stats.record_disk_write_failure();
            tracing::warn!(
                namespace = %namespace,
                key = %key,
                error = %e,
                "cache disk write failed, entry kept in memory only"
            );
        }

        Ok(())
    }

    /// [`Self::set`] with the manager's default TTL
    pub async fn set_default<T>(&self, namespace: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.set(namespace, key, value, self.inner.default_ttl).await
    }

    /// Remove one entry from both tiers. Returns whether anything existed.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        validate_namespace(namespace)?;
        let in_memory = self
            .inner
            .memory
            .remove(&EntryKey::new(namespace, key))
            .is_some();

        let path = entry_path(&self.inner.base_dir, namespace, key);
        let on_disk = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::file_system(path, "remove cache entry", e)),
        };

        Ok(in_memory || on_disk)
    }

    /// Drop every entry of a namespace. Returns the number of disk entries
    /// removed.
    pub async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        validate_namespace(namespace)?;
        self.inner.memory.retain(|id, _| id.namespace != namespace);

        let dir = namespace_dir(&self.inner.base_dir, namespace);
        let mut removed = 0;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::file_system(dir, "read cache namespace", e)),
        };
        while let Some(item) = entries
            .next_entry()
            .await
            .map_err(|e| Error::file_system(&dir, "read cache namespace", e))?
        {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::file_system(path, "remove cache entry", e)),
                }
            }
        }

        tracing::debug!(namespace = %namespace, removed, "cleared cache namespace");
        Ok(removed)
    }

    /// Evict every expired entry from both tiers
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        Self::cleanup_inner(&self.inner).await
    }

    async fn cleanup_inner(inner: &CacheInner) -> Result<CleanupReport> {
        let now = Utc::now();
        let before = inner.memory.len();
        inner.memory.retain(|_, entry| !entry.is_expired_at(now));
        let memory_removed = before.saturating_sub(inner.memory.len());

        let mut disk_removed = 0;
        let mut namespaces = match fs::read_dir(&inner.base_dir).await {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::file_system(&inner.base_dir, "read cache directory", e)),
        };

        while let Some(dir) = match namespaces.as_mut() {
            Some(entries) => entries
                .next_entry()
                .await
                .map_err(|e| Error::file_system(&inner.base_dir, "read cache directory", e))?,
            None => None,
        } {
            let dir_path = dir.path();
            if !dir.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let mut files = match fs::read_dir(&dir_path).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(path = %dir_path.display(), error = %e, "skipping unreadable cache namespace");
                    continue;
                }
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if !path.extension().is_some_and(|ext| ext == "json") {
                    continue;
                }
                let expired = match fs::read(&path).await {
                    Ok(raw) => serde_json::from_slice::<CacheEntry>(&raw)
                        .map(|entry| entry.is_expired_at(now))
                        .unwrap_or(true),
                    Err(_) => false,
                };
                if expired && fs::remove_file(&path).await.is_ok() {
                    disk_removed += 1;
                }
            }
        }

        let report = CleanupReport {
            memory_removed,
            disk_removed,
        };
        inner.stats.record_evictions(report.total() as u64);
        if report.total() > 0 {
            tracing::debug!(memory_removed, disk_removed, "expired cache entries removed");
        }
        Ok(report)
    }

    /// Return the cached value or compute, store and return it
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(namespace, key).await? {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(namespace, key, &value, ttl).await?;
        Ok(value)
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.inner.stats.snapshot(self.inner.memory.len())
    }

    /// Start the background cleanup task. A zero interval disables it.
    pub fn start_cleanup_task(&self, cleanup_interval: Duration) {
        if cleanup_interval == Duration::ZERO {
            return;
        }

        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = Self::cleanup_inner(&inner).await {
                    tracing::warn!(error = %e, "cache cleanup error");
                }
            }
        });

        if let Some(previous) = self.inner.cleanup_handle.write().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background cleanup task if one is running
    pub fn stop_cleanup_task(&self) {
        if let Some(handle) = self.inner.cleanup_handle.write().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Context {
        name: String,
        files: Vec<String>,
    }

    fn context() -> Context {
        Context {
            name: "tech".to_string(),
            files: vec!["src/main.rs".to_string()],
        }
    }

    fn manager(dir: &TempDir) -> CacheManager {
        CacheManager::new(dir.path().join("cache"), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_set_then_get_hits_memory() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);

        cache
            .set("project_context", "tech", &context(), Duration::from_secs(60))
            .await
            .unwrap();
        let got: Option<Context> = cache.get("project_context", "tech").await.unwrap();

        assert_eq!(got, Some(context()));
        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert!(dir.path().join("cache/project_context/tech.json").exists());
    }

    #[tokio::test]
    async fn test_disk_entry_is_promoted() {
        let dir = TempDir::new().unwrap();
        manager(&dir)
            .set("project_context", "tech", &context(), Duration::from_secs(60))
            .await
            .unwrap();

        let fresh = manager(&dir);
        assert_eq!(fresh.statistics().memory_entries, 0);
        let got: Option<Context> = fresh.get("project_context", "tech").await.unwrap();
        assert_eq!(got, Some(context()));
        assert_eq!(fresh.statistics().memory_entries, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_misses_before_cleanup() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);

        cache
            .set("analysis", "k", &1u32, Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let got: Option<u32> = cache.get("analysis", "k").await.unwrap();
        assert_eq!(got, None);
        assert!(!dir.path().join("cache/analysis/k.json").exists());
        assert!(cache.statistics().evictions >= 1);
    }

    #[tokio::test]
    async fn test_one_second_ttl_misses_in_both_tiers_after_two_seconds() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache
            .set("analysis", "short", &"v", Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        let from_memory: Option<String> = cache.get("analysis", "short").await.unwrap();
        assert_eq!(from_memory, None);

        let fresh = manager(&dir);
        let from_disk: Option<String> = fresh.get("analysis", "short").await.unwrap();
        assert_eq!(from_disk, None);
    }

    #[tokio::test]
    async fn test_disk_tier_enforces_its_own_expiry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache/analysis/old.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"data":1,"created_at":"2020-01-01T00:00:00Z","expires_at":"2020-01-01T01:00:00Z","ttl":3600}"#,
        )
        .unwrap();

        let got: Option<u32> = manager(&dir).get("analysis", "old").await.unwrap();
        assert_eq!(got, None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache/analysis/bad.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{{").unwrap();

        let got: Option<u32> = manager(&dir).get("analysis", "bad").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_disk_failure_does_not_fail_set() {
        let dir = TempDir::new().unwrap();
        // A regular file where the cache directory should be
        let blocked = dir.path().join("cache");
        std::fs::write(&blocked, "not a directory").unwrap();
        let cache = CacheManager::new(&blocked, Duration::from_secs(60));

        cache.set("analysis", "k", &7u32, Duration::from_secs(60)).await.unwrap();

        let got: Option<u32> = cache.get("analysis", "k").await.unwrap();
        assert_eq!(got, Some(7));
        assert_eq!(cache.statistics().disk_write_failures, 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear_namespace() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        for key in ["a", "b", "c"] {
            cache.set("ns", key, &key, Duration::from_secs(60)).await.unwrap();
        }
        cache.set("other", "a", &"keep", Duration::from_secs(60)).await.unwrap();

        assert!(cache.delete("ns", "a").await.unwrap());
        assert!(!cache.delete("ns", "a").await.unwrap());
        assert_eq!(cache.clear_namespace("ns").await.unwrap(), 2);

        let gone: Option<String> = cache.get("ns", "b").await.unwrap();
        assert_eq!(gone, None);
        let kept: Option<String> = cache.get("other", "a").await.unwrap();
        assert_eq!(kept.as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn test_cleanup_expired_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.set("ns", "short", &1, Duration::from_millis(20)).await.unwrap();
        cache.set("ns", "long", &2, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let report = cache.cleanup_expired().await.unwrap();
        assert_eq!(report.memory_removed, 1);
        assert_eq!(report.disk_removed, 1);
        assert_eq!(cache.statistics().memory_entries, 1);
        assert!(dir.path().join("cache/ns/long.json").exists());
    }

    #[tokio::test]
    async fn test_unsafe_keys_are_hashed_on_disk() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.set("ns", "../../escape", &1, Duration::from_secs(60)).await.unwrap();

        assert!(!dir.path().join("escape.json").exists());
        let fresh = manager(&dir);
        let got: Option<i32> = fresh.get("ns", "../../escape").await.unwrap();
        assert_eq!(got, Some(1));
    }

    #[tokio::test]
    async fn test_get_or_compute_memoizes() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u32 = cache
                .get_or_compute("ns", "expensive", Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_cleanup_runs() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.set("ns", "short", &1, Duration::from_millis(10)).await.unwrap();

        cache.start_cleanup_task(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.stop_cleanup_task();

        assert_eq!(cache.statistics().memory_entries, 0);
        assert!(!dir.path().join("cache/ns/short.json").exists());
    }
}
