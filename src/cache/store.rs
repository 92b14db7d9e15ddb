//! Cache-aside store with per-key single-flight loading.
//!
//! Reads go straight to the backend. A miss takes the distributed lock for the
//! key, reads again, and only then runs the loader, so concurrent misses on one
//! key collapse into a single recompute. Forced loads always take the lock.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::application::repos::RepoError;

use super::backend::CacheBackend;
use super::codec::ValueCodec;
use super::config::CacheConfig;
use super::error::CacheError;
use super::lock::{self, LockGuard, LockProvider};

pub struct KeyedCacheStore<V, C> {
    name: &'static str,
    backend: Arc<dyn CacheBackend>,
    locks: Arc<dyn LockProvider>,
    codec: C,
    config: CacheConfig,
    _value: PhantomData<fn() -> V>,
}

impl<V, C> KeyedCacheStore<V, C>
where
    V: Send,
    C: ValueCodec<V>,
{
    pub fn new(
        name: &'static str,
        backend: Arc<dyn CacheBackend>,
        locks: Arc<dyn LockProvider>,
        codec: C,
        config: CacheConfig,
    ) -> Self {
        Self {
            name,
            backend,
            locks,
            codec,
            config,
            _value: PhantomData,
        }
    }

    /// Returns the cached value, running `loader` under the key's lock on a miss.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        if let Some(value) = self.read(key).await? {
            counter!("kinfeed_cache_hit_total", "cache" => self.name).increment(1);
            debug!(cache = self.name, key, "Cache hit");
            return Ok(value);
        }
        counter!("kinfeed_cache_miss_total", "cache" => self.name).increment(1);

        let guard = self.lock(key).await?;
        // Another holder may have filled the key while we waited.
        let result = match self.read(key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => self.fill(key, loader).await,
            Err(err) => Err(err),
        };
        self.release(guard).await;
        result
    }

    /// Recomputes the value unconditionally and overwrites the cached copy.
    pub async fn load<F, Fut>(&self, key: &str, loader: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        let guard = self.lock(key).await?;
        let result = self.fill(key, loader).await;
        self.release(guard).await;
        result
    }

    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        self.backend.flush().await?;
        counter!("kinfeed_cache_flush_total", "cache" => self.name).increment(1);
        info!(cache = self.name, "Cache flushed");
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<V>, CacheError> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let value = self.codec.decode(&bytes).map_err(|err| {
                    warn!(cache = self.name, key, error = %err, "Cached value is unreadable");
                    CacheError::decode(key, err)
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn fill<F, Fut>(&self, key: &str, loader: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        let started = Instant::now();
        let value = loader().await.map_err(|err| {
            warn!(cache = self.name, key, error = %err, "Cache loader failed");
            CacheError::Loader(err)
        })?;
        histogram!("kinfeed_cache_load_ms", "cache" => self.name)
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let bytes = self
            .codec
            .encode(&value)
            .map_err(|err| CacheError::encode(key, err))?;
        self.backend.set(key, bytes, self.config.ttl).await?;
        debug!(cache = self.name, key, "Cache entry stored");
        Ok(value)
    }

    async fn lock(&self, key: &str) -> Result<LockGuard, CacheError> {
        lock::acquire(&self.locks, key, &self.config.lock_policy())
            .await
            .inspect_err(|err| {
                warn!(cache = self.name, key, error = %err, "Failed to obtain cache lock");
            })
    }

    async fn release(&self, guard: LockGuard) {
        let key = guard.key().to_string();
        if let Err(err) = guard.release().await {
            warn!(
                cache = self.name,
                key = key.as_str(),
                error = %err,
                "Failed to release cache lock"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::codec::JsonCodec;

    fn store(backend: Arc<MemoryBackend>) -> KeyedCacheStore<Vec<u32>, JsonCodec<Vec<u32>>> {
        let config = CacheConfig {
            ttl: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(5),
            lock_retries: 200,
            lock_retry_delay: Duration::from_millis(5),
        };
        KeyedCacheStore::new(
            "test",
            backend.clone(),
            backend,
            JsonCodec::new(),
            config,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_run_loader_once() {
        let store = Arc::new(store(Arc::new(MemoryBackend::new())));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                store
                    .get_or_load("feed:1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec![7, 8, 9])
                    })
                    .await
            }));
        }

        for task in tasks {
            let value = task.await.expect("join").expect("get_or_load");
            assert_eq!(value, vec![7, 8, 9]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_load_replaces_cached_value() {
        let store = store(Arc::new(MemoryBackend::new()));
        let first = store
            .get_or_load("feed:1", || async { Ok(vec![1]) })
            .await
            .expect("first");
        assert_eq!(first, vec![1]);

        let reloaded = store
            .load("feed:1", || async { Ok(vec![2, 1]) })
            .await
            .expect("reload");
        assert_eq!(reloaded, vec![2, 1]);

        let cached = store
            .get_or_load("feed:1", || async { Ok(vec![99]) })
            .await
            .expect("cached");
        assert_eq!(cached, vec![2, 1]);
    }

    #[tokio::test]
    async fn loader_failure_releases_lock() {
        let store = store(Arc::new(MemoryBackend::new()));
        let err = store
            .load("feed:1", || async {
                Err(RepoError::from_persistence("connection reset"))
            })
            .await
            .expect_err("loader fails");
        assert!(matches!(err, CacheError::Loader(_)));

        let value = store
            .get_or_load("feed:1", || async { Ok(vec![3]) })
            .await
            .expect("lock was released");
        assert_eq!(value, vec![3]);
    }

    #[tokio::test]
    async fn unreadable_entry_surfaces_decode_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set("feed:1", b"not json".to_vec(), Duration::from_secs(60))
            .await
            .expect("seed");
        let store = store(backend);

        let err = store
            .get_or_load("feed:1", || async { Ok(vec![1]) })
            .await
            .expect_err("decode fails");
        assert!(matches!(err, CacheError::Decode { ref key, .. } if key == "feed:1"));
    }

    #[tokio::test]
    async fn invalidate_all_is_idempotent() {
        let store = store(Arc::new(MemoryBackend::new()));
        store
            .get_or_load("feed:1", || async { Ok(vec![1]) })
            .await
            .expect("fill");

        store.invalidate_all().await.expect("flush");
        store.invalidate_all().await.expect("flush again");

        let value = store
            .get_or_load("feed:1", || async { Ok(vec![2]) })
            .await
            .expect("reload");
        assert_eq!(value, vec![2]);
    }
}
