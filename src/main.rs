use std::{process, sync::Arc};

use kinfeed::{
    application::{
        error::AppError,
        feed::FeedService,
        friends::FriendService,
        posts::PostService,
        repos::{FeedRepo, FriendsRepo, PostsRepo},
    },
    broker::{Broker, ConsumerSpec, MemoryBroker, Publisher},
    cache::{CacheBackend, CacheConfig, FeedCache, LockProvider, MemoryBackend, SubscriberCache},
    config,
    feed::{FeedUpdater, LiveUpdateMultiplexer, NotificationPublisher, UserTopics},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        memory::InMemoryRepositories,
        redis::{self as redis_infra, RedisBroker, RedisCacheBackend},
        telemetry,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    info!("Migrations applied");
    Ok(())
}

struct Repositories {
    feed: Arc<dyn FeedRepo>,
    friends: Arc<dyn FriendsRepo>,
    posts: Arc<dyn PostsRepo>,
    db: Option<Arc<PostgresRepositories>>,
}

async fn init_repositories(settings: &config::Settings) -> Result<Repositories, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        warn!("No database configured, keeping posts and friendships in memory");
        let memory = Arc::new(InMemoryRepositories::new());
        return Ok(Repositories {
            feed: memory.clone(),
            friends: memory.clone(),
            posts: memory,
            db: None,
        });
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    let db = Arc::new(PostgresRepositories::new(pool));
    Ok(Repositories {
        feed: db.clone(),
        friends: db.clone(),
        posts: db.clone(),
        db: Some(db),
    })
}

async fn init_cache_backend(
    name: &str,
    url: Option<&String>,
    settings: &config::RedisSettings,
) -> Result<(Arc<dyn CacheBackend>, Arc<dyn LockProvider>), AppError> {
    match url {
        Some(url) => {
            let pool = redis_infra::connect(url, settings.pool_size.get(), settings.timeout).await?;
            let backend = Arc::new(RedisCacheBackend::new(pool));
            let cache: Arc<dyn CacheBackend> = backend.clone();
            let locks: Arc<dyn LockProvider> = backend;
            Ok((cache, locks))
        }
        None => {
            info!(cache = name, "Using in-process cache backend");
            let backend = Arc::new(MemoryBackend::new());
            let cache: Arc<dyn CacheBackend> = backend.clone();
            let locks: Arc<dyn LockProvider> = backend;
            Ok((cache, locks))
        }
    }
}

async fn init_broker(
    settings: &config::RedisSettings,
) -> Result<(Arc<dyn Broker>, Arc<dyn Publisher>), AppError> {
    match settings.broker_url.as_ref() {
        Some(url) => {
            let pool = redis_infra::connect(url, settings.pool_size.get(), settings.timeout).await?;
            let broker = Arc::new(
                RedisBroker::new(pool, url, settings.stream_max_len.get())
                    .map_err(|err| InfraError::redis(err.to_string()))?,
            );
            let consumer: Arc<dyn Broker> = broker.clone();
            let publisher: Arc<dyn Publisher> = broker;
            Ok((consumer, publisher))
        }
        None => {
            info!("Using in-process message broker");
            let broker = Arc::new(MemoryBroker::new());
            let consumer: Arc<dyn Broker> = broker.clone();
            let publisher: Arc<dyn Publisher> = broker;
            Ok((consumer, publisher))
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let (feed_backend, feed_locks) = init_cache_backend(
        "feed",
        settings.redis.feed_cache_url.as_ref(),
        &settings.redis,
    )
    .await?;
    let (subscriber_backend, subscriber_locks) = init_cache_backend(
        "subscribers",
        settings.redis.subscriber_cache_url.as_ref(),
        &settings.redis,
    )
    .await?;
    let (broker, publisher) = init_broker(&settings.redis).await?;

    let cache_config = CacheConfig::from(&settings.cache);
    let feeds = Arc::new(FeedCache::new(
        feed_backend,
        feed_locks,
        cache_config,
        repositories.feed.clone(),
        settings.feed.max_length.get(),
    ));
    let subscribers = Arc::new(SubscriberCache::new(
        subscriber_backend,
        subscriber_locks,
        cache_config,
        repositories.friends.clone(),
    ));

    let broker_settings = &settings.broker;
    let topics = UserTopics {
        routing_key: broker_settings.user_update_routing_key.clone(),
        queue: broker_settings.user_update_queue.clone(),
        consumer_tag: broker_settings.user_update_consumer_tag.clone(),
        instance_id: broker_settings.instance_id.clone(),
    };
    let notifier = Arc::new(NotificationPublisher::new(
        publisher.clone(),
        broker_settings.events_routing_key.clone(),
    ));

    let shutdown = CancellationToken::new();
    let updater = Arc::new(FeedUpdater::new(
        feeds.clone(),
        subscribers,
        publisher,
        topics.clone(),
    ));
    let events = broker
        .consume(ConsumerSpec {
            queue: broker_settings.events_queue.clone(),
            tag: broker_settings.events_consumer_tag.clone(),
            routing_key: broker_settings.events_routing_key.clone(),
            durable: true,
        })
        .await
        .map_err(|err| AppError::unexpected(format!("failed to consume feed events: {err}")))?;
    let updater_handle = updater.spawn(events, shutdown.clone());

    let live = LiveUpdateMultiplexer::new(
        broker,
        topics,
        settings.feed.live_channel_capacity.get(),
    );

    let state = HttpState {
        feed: Arc::new(FeedService::new(feeds, notifier.clone())),
        posts: Arc::new(PostService::new(repositories.posts, notifier.clone())),
        friends: Arc::new(FriendService::new(repositories.friends, notifier)),
        live: live.clone(),
        db: repositories.db,
    };

    let result = serve_http(&settings, state, shutdown.clone(), live.clone()).await;

    shutdown.cancel();
    match tokio::time::timeout(settings.server.graceful_shutdown, updater_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Feed updater task failed"),
        Err(_) => warn!("Feed updater did not stop within the shutdown timeout"),
    }
    live.shutdown().await;
    info!("kinfeed stopped");

    result
}

async fn serve_http(
    settings: &config::Settings,
    state: HttpState,
    shutdown: CancellationToken,
    live: LiveUpdateMultiplexer,
) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            shutdown.cancel();
            // Open live connections only finish once their subscriptions close.
            live.shutdown().await;
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}
