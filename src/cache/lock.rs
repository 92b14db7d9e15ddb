use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::CacheError;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.read",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.write",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

/// Expiring mutual exclusion keyed by string, shared between processes.
///
/// A lock is owned by whoever presents the token it was taken with; `unlock`
/// with any other token leaves it in place.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub tries: u32,
    pub retry_delay: Duration,
}

pub(crate) fn lock_key(key: &str) -> String {
    format!("{key}-lock")
}

/// Takes the lock guarding `key`, retrying up to `policy.tries` times.
pub async fn acquire(
    provider: &Arc<dyn LockProvider>,
    key: &str,
    policy: &LockPolicy,
) -> Result<LockGuard, CacheError> {
    let lock_key = lock_key(key);
    let token = Uuid::new_v4().to_string();
    let tries = policy.tries.max(1);

    for attempt in 1..=tries {
        if provider.try_lock(&lock_key, &token, policy.ttl).await? {
            debug!(key = lock_key.as_str(), attempt, "Acquired cache lock");
            return Ok(LockGuard {
                provider: Arc::clone(provider),
                key: lock_key,
                token,
                released: false,
            });
        }
        if attempt < tries {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    Err(CacheError::LockTimeout {
        key: key.to_string(),
        attempts: tries,
    })
}

/// Held per-key lock. Prefer [`LockGuard::release`]; dropping the guard
/// schedules the unlock on the current runtime instead.
pub struct LockGuard {
    provider: Arc<dyn LockProvider>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), CacheError> {
        self.released = true;
        let held = self.provider.unlock(&self.key, &self.token).await?;
        if !held {
            warn!(
                key = self.key.as_str(),
                "Cache lock expired before it was released"
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                key = self.key.as_str(),
                "Cache lock dropped outside a runtime; it will expire on its own"
            );
            return;
        };
        let provider = Arc::clone(&self.provider);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = provider.unlock(&key, &token).await {
                warn!(key = key.as_str(), error = %err, "Failed to release dropped cache lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;

    fn policy(tries: u32) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_secs(5),
            tries,
            retry_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn mutex_lock_recovers_from_poison() {
        let lock = Arc::new(Mutex::new(1_u32));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().expect("first lock");
            panic!("poison the mutex");
        })
        .join();

        assert!(lock.is_poisoned());
        let guard = mutex_lock(&lock, "cache::lock::tests", "recover");
        assert_eq!(*guard, 1);
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryBackend::new());
        let held = acquire(&provider, "feed:1", &policy(1))
            .await
            .expect("first acquire");

        let err = acquire(&provider, "feed:1", &policy(3))
            .await
            .err()
            .expect("second acquire must time out");
        assert!(matches!(
            err,
            CacheError::LockTimeout { ref key, attempts: 3 } if key == "feed:1"
        ));

        held.release().await.expect("release");
        let again = acquire(&provider, "feed:1", &policy(1))
            .await
            .expect("acquire after release");
        assert_eq!(again.key(), "feed:1-lock");
        again.release().await.expect("release");
    }

    #[tokio::test]
    async fn unlock_with_foreign_token_is_ignored() {
        let provider = MemoryBackend::new();
        assert!(
            provider
                .try_lock("k-lock", "owner", Duration::from_secs(5))
                .await
                .expect("lock")
        );
        assert!(!provider.unlock("k-lock", "intruder").await.expect("unlock"));
        assert!(
            !provider
                .try_lock("k-lock", "other", Duration::from_secs(5))
                .await
                .expect("relock")
        );
        assert!(provider.unlock("k-lock", "owner").await.expect("unlock"));
    }

    #[tokio::test]
    async fn dropped_guard_unlocks_in_background() {
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryBackend::new());
        {
            let _guard = acquire(&provider, "subscribers:1", &policy(1))
                .await
                .expect("acquire");
        }
        let again = acquire(&provider, "subscribers:1", &policy(20))
            .await
            .expect("lock is released after drop");
        again.release().await.expect("release");
    }
}
