//! Distributed cache-aside layer.
//!
//! - [`KeyedCacheStore`]: generic get-or-load store with per-key locking
//! - [`FeedCache`] / [`SubscriberCache`]: typed stores for feeds and followers
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_secs = 3600
//! lock_ttl_ms = 5000
//! lock_retries = 3
//! lock_retry_delay_ms = 2000
//! ```

pub mod backend;
pub mod codec;
mod config;
mod error;
mod feed;
pub mod lock;
mod store;

pub use backend::{CacheBackend, MemoryBackend};
pub use codec::{CodecError, JsonCodec, ValueCodec};
pub use config::CacheConfig;
pub use error::CacheError;
pub use feed::{FeedCache, SubscriberCache};
pub use lock::{LockGuard, LockPolicy, LockProvider};
pub use store::KeyedCacheStore;
