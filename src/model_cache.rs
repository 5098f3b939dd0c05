//! A process-wide, TTL-expiring cache for the neural model handle.
//!
//! Loading the Surya model set is the single most expensive startup cost in
//! Phase 2, so the handle is loaded once per run and kept until the TTL
//! lapses or the cache is evicted. Loading happens under its own lock, not
//! the entry lock, so concurrent readers are never blocked behind a load.

use std::{
    sync::LazyLock,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::{
    engines::{ModelHandle, NeuralOcrEngine},
    prelude::*,
};

/// Default time-to-live for a loaded model handle.
pub const DEFAULT_TTL_SECS: u64 = 1800;

/// Environment variable overriding the TTL, in seconds.
pub const TTL_ENV_VAR: &str = "SCHOLARDOC_MODEL_TTL_SECS";

/// The process-wide cache instance.
static MODEL_CACHE: LazyLock<ModelCache> = LazyLock::new(ModelCache::from_env);

/// Get the process-wide model cache.
pub fn global() -> &'static ModelCache {
    &MODEL_CACHE
}

/// Memory usage report for front-ends and the RPC server.
#[derive(Clone, Debug, Serialize)]
pub struct MemoryStats {
    pub device: Option<String>,
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub models_loaded: bool,
    pub cache_ttl: u64,
}

struct CacheEntry {
    handle: ModelHandle,
    loaded_at: Instant,
}

/// TTL-expiring holder for the neural model handle.
pub struct ModelCache {
    entry: Mutex<Option<CacheEntry>>,
    /// Serializes loads so a miss storm loads once. Never held while the
    /// entry lock is held.
    load_lock: Mutex<()>,
    ttl: Duration,
}

impl ModelCache {
    /// Build a cache with the TTL from the environment (or the default).
    fn from_env() -> Self {
        let ttl_secs = std::env::var(TTL_ENV_VAR)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TTL_SECS);
        Self::with_ttl(Duration::from_secs(ttl_secs))
    }

    /// Build a cache with an explicit TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        ModelCache {
            entry: Mutex::new(None),
            load_lock: Mutex::new(()),
            ttl,
        }
    }

    /// Get the cached handle, loading through `engine` on a miss.
    ///
    /// TTL expiry is enforced lazily, here and in [`Self::is_loaded`].
    #[instrument(level = "debug", skip_all, fields(device))]
    pub async fn get_models(
        &self,
        engine: &dyn NeuralOcrEngine,
        device: Option<&str>,
    ) -> Result<ModelHandle> {
        if let Some(handle) = self.fresh_handle().await {
            return Ok(handle);
        }

        // Serialize loading, then re-check: another task may have loaded
        // while we waited for the lock.
        let _loading = self.load_lock.lock().await;
        if let Some(handle) = self.fresh_handle().await {
            return Ok(handle);
        }

        // Load outside the entry lock so `is_loaded` and `memory_stats`
        // stay responsive during the (long) load.
        let handle = engine.load_models(device).await?;
        let mut entry = self.entry.lock().await;
        *entry = Some(CacheEntry {
            handle: handle.clone(),
            loaded_at: Instant::now(),
        });
        Ok(handle)
    }

    /// Return the cached handle if present and within TTL, clearing it when
    /// expired.
    async fn fresh_handle(&self) -> Option<ModelHandle> {
        let mut entry = self.entry.lock().await;
        match entry.as_ref() {
            Some(cached) if cached.loaded_at.elapsed() < self.ttl => {
                Some(cached.handle.clone())
            }
            Some(_) => {
                debug!("model cache entry expired");
                *entry = None;
                None
            }
            None => None,
        }
    }

    /// Is a live handle currently cached?
    pub async fn is_loaded(&self) -> bool {
        self.fresh_handle().await.is_some()
    }

    /// Drop the handle and release accelerator memory.
    pub async fn evict(&self, engine: &dyn NeuralOcrEngine) -> Result<()> {
        {
            let mut entry = self.entry.lock().await;
            *entry = None;
        }
        engine.release_accelerator_memory().await
    }

    /// Inter-document cleanup: release accelerator scratch memory but keep
    /// the models resident.
    pub async fn cleanup_between_documents(
        &self,
        engine: &dyn NeuralOcrEngine,
    ) -> Result<()> {
        engine.release_accelerator_memory().await
    }

    /// Report current memory usage and cache state.
    pub async fn memory_stats(&self) -> MemoryStats {
        let (device, models_loaded) = {
            let entry = self.entry.lock().await;
            match entry.as_ref() {
                Some(cached) if cached.loaded_at.elapsed() < self.ttl => {
                    (Some(cached.handle.device.clone()), true)
                }
                _ => (None, false),
            }
        };

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let allocated_bytes = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_processes(
                    sysinfo::ProcessesToUpdate::Some(&[pid]),
                    true,
                );
                system.process(pid).map(|p| p.memory())
            })
            .unwrap_or(0);

        MemoryStats {
            device,
            allocated_bytes,
            reserved_bytes: system.used_memory(),
            models_loaded,
            cache_ttl: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A stub engine that counts loads.
    #[derive(Default)]
    struct CountingEngine {
        loads: AtomicUsize,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl NeuralOcrEngine for CountingEngine {
        async fn load_models(&self, device: Option<&str>) -> Result<ModelHandle> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(ModelHandle {
                model_name: "stub".to_owned(),
                device: device.unwrap_or("cpu").to_owned(),
                load_seconds: 0.0,
            })
        }

        async fn convert_pdf(
            &self,
            _input_pdf: &Path,
            _models: &ModelHandle,
            _languages: &[String],
            _force_ocr: bool,
            _page_range: Option<(usize, usize)>,
        ) -> Result<String> {
            Ok(String::new())
        }

        async fn release_accelerator_memory(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_get_hits_the_cache() {
        let cache = ModelCache::with_ttl(Duration::from_secs(60));
        let engine = CountingEngine::default();
        assert!(!cache.is_loaded().await);

        cache.get_models(&engine, Some("cpu")).await.unwrap();
        cache.get_models(&engine, Some("cpu")).await.unwrap();
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_loaded().await);
    }

    #[tokio::test]
    async fn expired_entry_reloads() {
        let cache = ModelCache::with_ttl(Duration::from_millis(0));
        let engine = CountingEngine::default();
        cache.get_models(&engine, None).await.unwrap();
        cache.get_models(&engine, None).await.unwrap();
        assert_eq!(engine.loads.load(Ordering::SeqCst), 2);
        assert!(!cache.is_loaded().await);
    }

    #[tokio::test]
    async fn evict_clears_and_releases() {
        let cache = ModelCache::with_ttl(Duration::from_secs(60));
        let engine = CountingEngine::default();
        cache.get_models(&engine, None).await.unwrap();
        cache.evict(&engine).await.unwrap();
        assert!(!cache.is_loaded().await);
        assert_eq!(engine.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_between_documents_keeps_models() {
        let cache = ModelCache::with_ttl(Duration::from_secs(60));
        let engine = CountingEngine::default();
        cache.get_models(&engine, None).await.unwrap();
        cache.cleanup_between_documents(&engine).await.unwrap();
        assert!(cache.is_loaded().await);
        assert_eq!(engine.releases.load(Ordering::SeqCst), 1);
        let stats = cache.memory_stats().await;
        assert!(stats.models_loaded);
        assert_eq!(stats.cache_ttl, 60);
    }
}
