//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{CliArgs, Command, DatabaseOverride, MigrateArgs, ServeArgs, ServeOverrides};

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "kinfeed";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_REDIS_POOL_SIZE: usize = 16;
const DEFAULT_REDIS_TIMEOUT_MS: u64 = 2000;
const DEFAULT_REDIS_STREAM_MAX_LEN: usize = 10_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_LOCK_TTL_MS: u64 = 5000;
const DEFAULT_CACHE_LOCK_RETRIES: u32 = 3;
const DEFAULT_CACHE_LOCK_RETRY_DELAY_MS: u64 = 2000;
const DEFAULT_FEED_MAX_LENGTH: usize = 1000;
const DEFAULT_LIVE_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_EVENTS_ROUTING_KEY: &str = "feed.events";
const DEFAULT_EVENTS_QUEUE: &str = "feed.events";
const DEFAULT_EVENTS_CONSUMER_TAG: &str = "feed-updater-{instance_id}";
const DEFAULT_USER_UPDATE_ROUTING_KEY: &str = "feed.user.{user_id}";
const DEFAULT_USER_UPDATE_QUEUE: &str = "feed.user.{user_id}.{instance_id}";
const DEFAULT_USER_UPDATE_CONSUMER_TAG: &str = "live-{user_id}-{instance_id}";

const USER_ID_PLACEHOLDER: &str = "{user_id}";
const INSTANCE_ID_PLACEHOLDER: &str = "{instance_id}";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub feed: FeedSettings,
    pub broker: BrokerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Without a URL the service keeps its data in memory.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

/// Each absent URL falls back to an in-process implementation.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub feed_cache_url: Option<String>,
    pub subscriber_cache_url: Option<String>,
    pub broker_url: Option<String>,
    pub pool_size: NonZeroUsize,
    pub timeout: Duration,
    /// Approximate cap on entries kept per broker queue stream.
    pub stream_max_len: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl_secs: NonZeroU64,
    pub lock_ttl_ms: NonZeroU64,
    pub lock_retries: NonZeroU32,
    pub lock_retry_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub max_length: NonZeroUsize,
    pub live_channel_capacity: NonZeroUsize,
}

/// Routing keys, queue names and consumer tags. The `user_update_*`
/// templates still contain `{user_id}`; `{instance_id}` is already resolved
/// in the events names and kept separately for the per-user templates.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub instance_id: String,
    pub events_routing_key: String,
    pub events_queue: String,
    pub events_consumer_tag: String,
    pub user_update_routing_key: String,
    pub user_update_queue: String,
    pub user_update_consumer_tag: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("KINFEED").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
    feed: RawFeedSettings,
    broker: RawBrokerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(url) = overrides.redis_feed_cache_url.as_ref() {
            self.redis.feed_cache_url = Some(url.clone());
        }
        if let Some(url) = overrides.redis_subscriber_cache_url.as_ref() {
            self.redis.subscriber_cache_url = Some(url.clone());
        }
        if let Some(url) = overrides.redis_broker_url.as_ref() {
            self.redis.broker_url = Some(url.clone());
        }
        if let Some(length) = overrides.feed_max_length {
            self.feed.max_length = Some(length);
        }
        if let Some(id) = overrides.instance_id.as_ref() {
            self.broker.instance_id = Some(id.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            redis,
            cache,
            feed,
            broker,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            redis: build_redis_settings(redis)?,
            cache: build_cache_settings(cache)?,
            feed: build_feed_settings(feed)?,
            broker: build_broker_settings(broker)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url: non_blank(database.url),
        max_connections,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let feed_cache_url = non_blank(redis.feed_cache_url);
    let subscriber_cache_url = non_blank(redis.subscriber_cache_url);

    // Invalidation flushes a whole database, so the two caches must not share one.
    if let (Some(feed), Some(subscribers)) = (&feed_cache_url, &subscriber_cache_url) {
        if feed == subscribers {
            return Err(LoadError::invalid(
                "redis.subscriber_cache_url",
                "must point to a different database than redis.feed_cache_url",
            ));
        }
    }

    let pool_size = NonZeroUsize::new(redis.pool_size.unwrap_or(DEFAULT_REDIS_POOL_SIZE))
        .ok_or_else(|| LoadError::invalid("redis.pool_size", "must be greater than zero"))?;

    let timeout_ms = redis.timeout_ms.unwrap_or(DEFAULT_REDIS_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "redis.timeout_ms",
            "must be greater than zero",
        ));
    }

    let stream_max_len = NonZeroUsize::new(
        redis
            .stream_max_len
            .unwrap_or(DEFAULT_REDIS_STREAM_MAX_LEN),
    )
    .ok_or_else(|| LoadError::invalid("redis.stream_max_len", "must be greater than zero"))?;

    Ok(RedisSettings {
        feed_cache_url,
        subscriber_cache_url,
        broker_url: non_blank(redis.broker_url),
        pool_size,
        timeout: Duration::from_millis(timeout_ms),
        stream_max_len,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl_secs = NonZeroU64::new(cache.ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
        .ok_or_else(|| LoadError::invalid("cache.ttl_secs", "must be greater than zero"))?;
    let lock_ttl_ms = NonZeroU64::new(cache.lock_ttl_ms.unwrap_or(DEFAULT_CACHE_LOCK_TTL_MS))
        .ok_or_else(|| LoadError::invalid("cache.lock_ttl_ms", "must be greater than zero"))?;
    let lock_retries = non_zero_u32(
        cache
            .lock_retries
            .unwrap_or(DEFAULT_CACHE_LOCK_RETRIES)
            .into(),
        "cache.lock_retries",
    )?;

    Ok(CacheSettings {
        ttl_secs,
        lock_ttl_ms,
        lock_retries,
        lock_retry_delay_ms: cache
            .lock_retry_delay_ms
            .unwrap_or(DEFAULT_CACHE_LOCK_RETRY_DELAY_MS),
    })
}

fn build_feed_settings(feed: RawFeedSettings) -> Result<FeedSettings, LoadError> {
    let max_length = NonZeroUsize::new(feed.max_length.unwrap_or(DEFAULT_FEED_MAX_LENGTH))
        .ok_or_else(|| LoadError::invalid("feed.max_length", "must be greater than zero"))?;
    let live_channel_capacity = NonZeroUsize::new(
        feed.live_channel_capacity
            .unwrap_or(DEFAULT_LIVE_CHANNEL_CAPACITY),
    )
    .ok_or_else(|| {
        LoadError::invalid("feed.live_channel_capacity", "must be greater than zero")
    })?;

    Ok(FeedSettings {
        max_length,
        live_channel_capacity,
    })
}

fn build_broker_settings(broker: RawBrokerSettings) -> Result<BrokerSettings, LoadError> {
    let instance_id =
        non_blank(broker.instance_id).unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let resolve = |value: Option<String>, default: &str, key: &'static str| {
        let template = non_blank(value).unwrap_or_else(|| default.to_string());
        if template.contains(USER_ID_PLACEHOLDER) {
            return Err(LoadError::invalid(key, "must not contain {user_id}"));
        }
        Ok(template.replace(INSTANCE_ID_PLACEHOLDER, &instance_id))
    };
    let events_routing_key = resolve(
        broker.events_routing_key,
        DEFAULT_EVENTS_ROUTING_KEY,
        "broker.events_routing_key",
    )?;
    let events_queue = resolve(
        broker.events_queue,
        DEFAULT_EVENTS_QUEUE,
        "broker.events_queue",
    )?;
    let events_consumer_tag = resolve(
        broker.events_consumer_tag,
        DEFAULT_EVENTS_CONSUMER_TAG,
        "broker.events_consumer_tag",
    )?;

    let per_user = |value: Option<String>, default: &str, key: &'static str| {
        let template = non_blank(value).unwrap_or_else(|| default.to_string());
        if !template.contains(USER_ID_PLACEHOLDER) {
            return Err(LoadError::invalid(key, "must contain {user_id}"));
        }
        Ok(template)
    };
    let user_update_routing_key = per_user(
        broker.user_update_routing_key,
        DEFAULT_USER_UPDATE_ROUTING_KEY,
        "broker.user_update_routing_key",
    )?;
    let user_update_queue = per_user(
        broker.user_update_queue,
        DEFAULT_USER_UPDATE_QUEUE,
        "broker.user_update_queue",
    )?;
    let user_update_consumer_tag = per_user(
        broker.user_update_consumer_tag,
        DEFAULT_USER_UPDATE_CONSUMER_TAG,
        "broker.user_update_consumer_tag",
    )?;

    Ok(BrokerSettings {
        instance_id,
        events_routing_key,
        events_queue,
        events_consumer_tag,
        user_update_routing_key,
        user_update_queue,
        user_update_consumer_tag,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    feed_cache_url: Option<String>,
    subscriber_cache_url: Option<String>,
    broker_url: Option<String>,
    pool_size: Option<usize>,
    timeout_ms: Option<u64>,
    stream_max_len: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_secs: Option<u64>,
    lock_ttl_ms: Option<u64>,
    lock_retries: Option<u32>,
    lock_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFeedSettings {
    max_length: Option<usize>,
    live_channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    instance_id: Option<String>,
    events_routing_key: Option<String>,
    events_queue: Option<String>,
    events_consumer_tag: Option<String>,
    user_update_routing_key: Option<String>,
    user_update_queue: Option<String>,
    user_update_consumer_tag: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
