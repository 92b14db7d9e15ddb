//! Cache configuration.
//!
//! TTL and distributed lock policy shared by every keyed store, read from the
//! `[cache]` table of `kinfeed.toml`.

use std::time::Duration;

use super::lock::LockPolicy;

const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_LOCK_TTL_MS: u64 = 5000;
const DEFAULT_LOCK_RETRIES: u32 = 3;
const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Lifetime of a stored value.
    pub ttl: Duration,
    /// Expiry of a per-key lock. Must exceed the slowest expected loader.
    pub lock_ttl: Duration,
    /// Attempts made to take a per-key lock before giving up.
    pub lock_retries: u32,
    /// Pause between lock attempts.
    pub lock_retry_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_DELAY_MS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: Duration::from_secs(settings.ttl_secs.get()),
            lock_ttl: Duration::from_millis(settings.lock_ttl_ms.get()),
            lock_retries: settings.lock_retries.get(),
            lock_retry_delay: Duration::from_millis(settings.lock_retry_delay_ms),
        }
    }
}

impl CacheConfig {
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: self.lock_ttl,
            tries: self.lock_retries.max(1),
            retry_delay: self.lock_retry_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(3600));
        assert_eq!(config.lock_ttl, Duration::from_secs(5));
        assert_eq!(config.lock_retries, 3);
        assert_eq!(config.lock_retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn lock_policy_makes_at_least_one_attempt() {
        let config = CacheConfig {
            lock_retries: 0,
            ..Default::default()
        };
        assert_eq!(config.lock_policy().tries, 1);
    }
}
